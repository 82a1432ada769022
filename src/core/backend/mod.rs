//! Execution backends.
//!
//! The orchestrator hands every eligible job to exactly one backend,
//! selected once at startup:
//!
//! - `remote` submits to a batch engine and returns immediately,
//! - `local::SerialBackend` runs each job in place as it is submitted,
//! - `local::SchedulerBackend` queues jobs and runs them in `complete()`
//!   with bounded concurrency.

pub mod local;
pub mod remote;

use std::sync::Arc;

use serde::Serialize;

use crate::config::ExecutionMode;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::job::{Handle, Job, SubTask};

pub use local::{SchedulerBackend, SerialBackend};
pub use remote::{BatchEngine, CommandEngine, DryRunEngine, RemoteBackend, SubmitRequest};

/// What running a job in place amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Computed,
    UpToDate,
}

/// Executes a single job in the current process.
pub trait JobRunner: Send + Sync {
    fn run_job(&self, task: &SubTask) -> Result<UnitOutcome>;
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(UnitOutcome),
    Failed(Error),
    /// Not run because this predecessor did not succeed.
    DependencyFailed(SubTask),
}

/// Result of a job the backend ran after `submit` returned.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub task: SubTask,
    pub outcome: JobOutcome,
}

pub trait ExecutionBackend {
    fn name(&self) -> &'static str;

    fn is_local(&self) -> bool;

    /// The job has finished by the time `submit` returns.
    fn completes_on_submit(&self) -> bool {
        false
    }

    /// Submit `job`, which must not start before the jobs behind `dependencies`.
    ///
    /// Returns the job's handle. An error means the job was not accepted
    /// (remote) or failed while running in place (serial).
    fn submit(&mut self, job: &Job, dependencies: &[Handle]) -> Result<Handle>;

    /// Wait for deferred work and report it. Backends that finish (or hand
    /// off) every job inside `submit` report nothing.
    fn complete(&mut self) -> Result<Vec<CompletedJob>> {
        Ok(Vec::new())
    }
}

/// Backend for `mode`. Dry runs always go through the fake batch engine so
/// nothing is executed.
pub fn select(
    ctx: &RunContext,
    mode: ExecutionMode,
    runner: Arc<dyn JobRunner>,
) -> Result<Box<dyn ExecutionBackend>> {
    if ctx.dry_run {
        let first = ctx
            .config
            .grid
            .as_ref()
            .map(|grid| grid.first_fake_job_id)
            .unwrap_or_default();
        return Ok(Box::new(RemoteBackend::new(
            Box::new(DryRunEngine::new(first)),
            remote::reinvocation_args(ctx)?,
        )));
    }

    let backend: Box<dyn ExecutionBackend> = match mode {
        ExecutionMode::Remote => {
            let submit = ctx
                .config
                .grid
                .as_ref()
                .and_then(|grid| grid.submit.as_ref())
                .ok_or_else(|| {
                    Error::config_missing_key("grid.submit", None)
                        .with_hint("Configure the batch engine submit command, e.g. {\"command\": \"qsub -terse {{waitFor}} {{command}}\"}")
                })?;
            Box::new(RemoteBackend::new(
                Box::new(CommandEngine::from_config(submit)?),
                remote::reinvocation_args(ctx)?,
            ))
        }
        ExecutionMode::LocalSerial => Box::new(SerialBackend::new(runner)),
        ExecutionMode::LocalScheduler { workers } => {
            Box::new(SchedulerBackend::new(runner, workers))
        }
    };
    Ok(backend)
}
