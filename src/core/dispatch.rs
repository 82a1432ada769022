//! Routes one scheduled sub-task to its computation entry point.
//!
//! Dispatchers are layered the way the toolchain is: the ISV layer knows
//! the ISV sub-tasks, the GMM layer the normalization/k-means/GMM ones, and
//! the base toolchain layer everything else. A [`DispatcherChain`] asks each
//! layer in turn; the first that recognizes the sub-task handles it.

use crate::artifacts::item_source;
use crate::computation::ComputeRequest;
use crate::context::RunContext;
use crate::error::Result;
use crate::job::SubTask;

pub trait SubTaskDispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `task` if this dispatcher knows it.
    ///
    /// `Ok(false)` means "not mine"; computation errors propagate.
    fn dispatch(&self, task: &SubTask, ctx: &RunContext) -> Result<bool>;
}

/// Resolve the request parameters and invoke the computation once.
fn invoke(task: &SubTask, ctx: &RunContext) -> Result<()> {
    let mut request = ComputeRequest::new(task).with_flags(ctx.force, ctx.config.clean_intermediate);

    if let Some(source) = item_source(task) {
        let items = ctx.store.list(&source.category, &source.purpose)?;
        match ctx.policy().shard_range(task, items.len())? {
            Some(range) => request = request.with_range(range),
            None => {
                log_status!(
                    "dispatch",
                    "{}: no items in this shard ({} items total), nothing to do",
                    task,
                    items.len()
                );
                return Ok(());
            }
        }
    }

    if task.is_maximization() {
        request = request.with_parallel_jobs(ctx.config.stage_shards(task.stage()));
    }

    ctx.computation.compute(&request)
}

/// Preprocessing, extraction, projection, enrollment and scoring.
pub struct ToolchainDispatcher;

impl SubTaskDispatcher for ToolchainDispatcher {
    fn name(&self) -> &'static str {
        "toolchain"
    }

    fn dispatch(&self, task: &SubTask, ctx: &RunContext) -> Result<bool> {
        match task {
            SubTask::Preprocess { .. }
            | SubTask::TrainExtractor
            | SubTask::Extract { .. }
            | SubTask::Project { .. }
            | SubTask::Enroll { .. }
            | SubTask::ComputeScores { .. }
            | SubTask::Concatenate { .. }
            | SubTask::Calibrate { .. } => {
                invoke(task, ctx)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Feature normalization, k-means and GMM training.
pub struct GmmDispatcher;

impl SubTaskDispatcher for GmmDispatcher {
    fn name(&self) -> &'static str {
        "gmm"
    }

    fn dispatch(&self, task: &SubTask, ctx: &RunContext) -> Result<bool> {
        match task {
            SubTask::NormalizeFeatures { .. }
            | SubTask::KmeansInit
            | SubTask::KmeansEStep { .. }
            | SubTask::KmeansMStep { .. }
            | SubTask::GmmInit
            | SubTask::GmmEStep { .. }
            | SubTask::GmmMStep { .. } => {
                invoke(task, ctx)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// GMM statistics projection and ISV training.
pub struct IsvDispatcher;

impl SubTaskDispatcher for IsvDispatcher {
    fn name(&self) -> &'static str {
        "isv"
    }

    fn dispatch(&self, task: &SubTask, ctx: &RunContext) -> Result<bool> {
        match task {
            SubTask::GmmProject { .. }
            | SubTask::IsvEStep { .. }
            | SubTask::IsvMStep { .. }
            | SubTask::SaveProjector => {
                invoke(task, ctx)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub struct DispatcherChain {
    layers: Vec<Box<dyn SubTaskDispatcher>>,
}

impl DispatcherChain {
    pub fn new(layers: Vec<Box<dyn SubTaskDispatcher>>) -> Self {
        Self { layers }
    }

    /// The full ISV toolchain: ISV, then GMM, then the base layer.
    pub fn isv() -> Self {
        Self::new(vec![
            Box::new(IsvDispatcher),
            Box::new(GmmDispatcher),
            Box::new(ToolchainDispatcher),
        ])
    }
}

impl SubTaskDispatcher for DispatcherChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn dispatch(&self, task: &SubTask, ctx: &RunContext) -> Result<bool> {
        for layer in &self.layers {
            if layer.dispatch(task, ctx)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
