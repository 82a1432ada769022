//! Orchestration entry point.
//!
//! `run` has two separate paths:
//!
//! - with a sub-task selector, execute exactly that job in place (this is
//!   what a job submitted by the remote backend does on the engine node),
//! - without one, build the graph and push every eligible job through the
//!   selected backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::backend::{self, ExecutionBackend, JobOutcome, JobRunner, UnitOutcome};
use crate::config::{ExecutionMode, PipelineConfig};
use crate::context::RunContext;
use crate::dispatch::{DispatcherChain, SubTaskDispatcher};
use crate::error::{Error, ErrorCode, Result};
use crate::graph::{self, JobGraph};
use crate::job::{Handle, Shard, SubTask, SUB_TASK_NAMES};
use crate::stage::{QueueClass, Stage};
use crate::utils::io;

pub const RUN_INFO_FILE: &str = "gridchain-run.json";

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub sub_task: Option<SubTask>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutput {
    SubTask(SubTaskReport),
    Graph(RunReport),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskReport {
    pub job: String,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted by the batch engine.
    Submitted,
    /// Ran locally and succeeded.
    Completed,
    /// Outputs already present; not run.
    UpToDate,
    Failed,
    DependencyFailed,
    /// Not submitted because an earlier submission was rejected.
    NotSubmitted,
}

impl JobStatus {
    fn is_failure(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::DependencyFailed | JobStatus::NotSubmitted
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<Shard>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Predecessor that kept this job from running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    #[serde(skip)]
    pub error_code: Option<ErrorCode>,
}

impl JobReport {
    fn new(task: &SubTask, status: JobStatus) -> Self {
        Self {
            job: task.to_string(),
            stage: task.stage(),
            iteration: task.iteration(),
            shard: task.shard().filter(|s| s.count > 1),
            status,
            handle: None,
            error: None,
            dependency: None,
            error_code: None,
        }
    }

    fn fail(&mut self, err: &Error) {
        self.status = JobStatus::Failed;
        self.error = Some(err.message.clone());
        self.error_code = Some(err.code);
    }

    fn blocked_by(&mut self, dependency: &SubTask) {
        let err = Error::dependency_failed(self.job.as_str(), dependency.to_string());
        self.status = JobStatus::DependencyFailed;
        self.dependency = Some(dependency.to_string());
        self.error = Some(err.message);
        self.error_code = Some(err.code);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
    UpToDate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_jobs: usize,
    pub submitted: usize,
    pub completed: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub dependency_failed: usize,
    pub not_submitted: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub backend: String,
    pub dry_run: bool,
    pub status: RunStatus,
    pub jobs: Vec<JobReport>,
    /// Engine handle per job name (remote runs only).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub handles: BTreeMap<String, Handle>,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.job == name)
    }

    /// Code of the first real failure, falling back to dependency failure.
    pub fn failure_code(&self) -> Option<ErrorCode> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .find_map(|j| j.error_code)
            .or_else(|| {
                self.jobs
                    .iter()
                    .any(|j| j.status.is_failure())
                    .then_some(ErrorCode::JobDependencyFailed)
            })
    }
}

/// Run summary written next to the artifacts before anything is submitted.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo<'a> {
    pub run_id: &'a str,
    pub started_at: String,
    pub command_line: Vec<String>,
    pub mode: ExecutionMode,
    pub config: &'a PipelineConfig,
}

/// Executes jobs in place through the dispatcher chain.
pub struct InPlaceRunner {
    ctx: RunContext,
    dispatcher: Arc<dyn SubTaskDispatcher>,
}

impl InPlaceRunner {
    pub fn new(ctx: RunContext, dispatcher: Arc<dyn SubTaskDispatcher>) -> Self {
        Self { ctx, dispatcher }
    }
}

impl JobRunner for InPlaceRunner {
    fn run_job(&self, task: &SubTask) -> Result<UnitOutcome> {
        execute_sub_task(&self.ctx, self.dispatcher.as_ref(), task)
    }
}

pub fn run(ctx: &RunContext, request: &RunRequest) -> Result<RunOutput> {
    run_with(ctx, request, Arc::new(DispatcherChain::isv()))
}

pub fn run_with(
    ctx: &RunContext,
    request: &RunRequest,
    dispatcher: Arc<dyn SubTaskDispatcher>,
) -> Result<RunOutput> {
    let mode = ctx.config.execution_mode()?;

    match &request.sub_task {
        Some(task) => {
            ctx.config.validate()?;
            let outcome = execute_sub_task(ctx, dispatcher.as_ref(), task)?;
            Ok(RunOutput::SubTask(SubTaskReport {
                job: task.to_string(),
                outcome,
            }))
        }
        None => {
            let mut graph = graph::build(&ctx.config)?;
            let runner: Arc<dyn JobRunner> = Arc::new(InPlaceRunner::new(ctx.clone(), dispatcher));
            let mut backend = backend::select(ctx, mode, runner)?;

            let run_id = uuid::Uuid::new_v4().to_string();
            if !ctx.dry_run {
                write_run_info(ctx, &run_id, mode)?;
            }

            log_status!(
                "run",
                "{} jobs via {} backend",
                graph.len(),
                backend.name()
            );
            let report = submit_graph(ctx, &mut graph, backend.as_mut(), run_id)?;
            Ok(RunOutput::Graph(report))
        }
    }
}

/// Run one job in place: idempotence check, then dispatch.
pub fn execute_sub_task(
    ctx: &RunContext,
    dispatcher: &dyn SubTaskDispatcher,
    task: &SubTask,
) -> Result<UnitOutcome> {
    if !ctx.policy().should_run(task, ctx.force)? {
        log_status!("run", "{} is up to date", task);
        return Ok(UnitOutcome::UpToDate);
    }

    if !dispatcher.dispatch(task, ctx)? {
        return Err(Error::config_unknown_sub_task(task.name(), SUB_TASK_NAMES));
    }
    Ok(UnitOutcome::Computed)
}

/// Visit the graph in topological order and hand each eligible job to `backend`.
///
/// Jobs behind a failed predecessor are never submitted. A rejected
/// submission, or a failure on a backend that runs jobs inside `submit`,
/// stops the sequence; every later job is reported as not submitted.
pub fn submit_graph(
    ctx: &RunContext,
    graph: &mut JobGraph,
    backend: &mut dyn ExecutionBackend,
    run_id: String,
) -> Result<RunReport> {
    let order = graph.topological_order()?;
    let policy = ctx.policy();

    let mut reports: Vec<JobReport> = Vec::with_capacity(order.len());
    let mut position: HashMap<SubTask, usize> = HashMap::with_capacity(order.len());
    let mut aborted = false;

    for task in &order {
        let job = graph
            .get(task)
            .ok_or_else(|| Error::internal_unexpected(format!("Job '{}' missing from graph", task)))?;
        let mut report = JobReport::new(task, JobStatus::Submitted);

        let failed_dependency = job.dependencies.iter().find(|dep| {
            position
                .get(*dep)
                .is_some_and(|&idx| reports[idx].status.is_failure())
        });

        if let Some(dep) = failed_dependency {
            report.blocked_by(dep);
        } else if aborted {
            report.status = JobStatus::NotSubmitted;
        } else {
            match policy.should_run(task, ctx.force) {
                Ok(false) => report.status = JobStatus::UpToDate,
                Ok(true) => {
                    let dependencies: Vec<Handle> = job
                        .dependencies
                        .iter()
                        .filter_map(|dep| graph.get(dep).and_then(|d| d.handle().cloned()))
                        .collect();

                    match backend.submit(job, &dependencies) {
                        Ok(handle) => {
                            if backend.completes_on_submit() {
                                report.status = JobStatus::Completed;
                            }
                            report.handle = Some(handle.clone());
                            if let Some(job) = graph.get_mut(task) {
                                job.assign_handle(handle)?;
                            }
                        }
                        Err(err) => {
                            log_status!("run", "{} failed: {}", task, err);
                            report.fail(&err);
                            if !backend.is_local() || backend.completes_on_submit() {
                                aborted = true;
                            }
                        }
                    }
                }
                Err(err) => {
                    log_status!("run", "{}: {}", task, err);
                    report.fail(&err);
                }
            }
        }

        position.insert(task.clone(), reports.len());
        reports.push(report);
    }

    for completed in backend.complete()? {
        let Some(&idx) = position.get(&completed.task) else {
            continue;
        };
        let report = &mut reports[idx];
        match &completed.outcome {
            JobOutcome::Succeeded(UnitOutcome::Computed) => report.status = JobStatus::Completed,
            JobOutcome::Succeeded(UnitOutcome::UpToDate) => report.status = JobStatus::UpToDate,
            JobOutcome::Failed(err) => report.fail(err),
            JobOutcome::DependencyFailed(dep) => report.blocked_by(dep),
        }
    }

    let handles = if backend.is_local() {
        BTreeMap::new()
    } else {
        graph
            .jobs()
            .iter()
            .filter_map(|job| job.handle().map(|h| (job.name.clone(), h.clone())))
            .collect()
    };

    let status = derive_overall_status(&reports);
    let summary = build_summary(&reports, status);

    Ok(RunReport {
        run_id,
        backend: backend.name().to_string(),
        dry_run: ctx.dry_run,
        status,
        jobs: reports,
        handles,
        summary,
    })
}

fn derive_overall_status(reports: &[JobReport]) -> RunStatus {
    let has_success = reports
        .iter()
        .any(|r| matches!(r.status, JobStatus::Submitted | JobStatus::Completed));
    let has_failed = reports.iter().any(|r| r.status.is_failure());
    let all_up_to_date = !reports.is_empty()
        && reports.iter().all(|r| r.status == JobStatus::UpToDate);

    if has_failed && has_success {
        return RunStatus::PartialSuccess;
    }
    if has_failed {
        return RunStatus::Failed;
    }
    if all_up_to_date {
        return RunStatus::UpToDate;
    }
    RunStatus::Success
}

fn build_summary(reports: &[JobReport], status: RunStatus) -> RunSummary {
    let count = |wanted: JobStatus| reports.iter().filter(|r| r.status == wanted).count();

    let next_actions = match status {
        RunStatus::PartialSuccess | RunStatus::Failed => vec![
            "Fix the failing job and re-run; jobs whose outputs exist are skipped".to_string(),
        ],
        _ => Vec::new(),
    };

    RunSummary {
        total_jobs: reports.len(),
        submitted: count(JobStatus::Submitted),
        completed: count(JobStatus::Completed),
        up_to_date: count(JobStatus::UpToDate),
        failed: count(JobStatus::Failed),
        dependency_failed: count(JobStatus::DependencyFailed),
        not_submitted: count(JobStatus::NotSubmitted),
        next_actions,
    }
}

pub fn write_run_info(ctx: &RunContext, run_id: &str, mode: ExecutionMode) -> Result<()> {
    let info = RunInfo {
        run_id,
        started_at: chrono::Utc::now().to_rfc3339(),
        command_line: std::env::args().collect(),
        mode,
        config: &ctx.config,
    };
    let content = serde_json::to_string_pretty(&info)
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize run info".to_string())))?;

    let path = ctx.config.artifacts_root().join(RUN_INFO_FILE);
    io::write_file_atomic(&path, &content, "write run info")
}

/// One job as `gridchain plan` prints it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedJob {
    pub name: String,
    pub stage: Stage,
    pub queue: QueueClass,
    pub shard_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphPlan {
    pub total_jobs: usize,
    pub stages: Vec<StagePlan>,
    pub jobs: Vec<PlannedJob>,
    pub frontier: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagePlan {
    pub stage: Stage,
    pub jobs: usize,
}

/// Build the graph for `config` without submitting anything.
pub fn plan(config: &PipelineConfig) -> Result<GraphPlan> {
    let graph = graph::build(config)?;

    let jobs: Vec<PlannedJob> = graph
        .jobs()
        .iter()
        .map(|job| PlannedJob {
            name: job.name.clone(),
            stage: job.task.stage(),
            queue: if job.task.is_maximization() {
                QueueClass::Training
            } else {
                job.task.stage().queue()
            },
            shard_count: job.shard_count,
            dependencies: job.dependencies.iter().map(|d| d.to_string()).collect(),
        })
        .collect();

    let stages = Stage::ALL
        .iter()
        .map(|&stage| StagePlan {
            stage,
            jobs: graph.jobs_of_stage(stage).count(),
        })
        .filter(|s| s.jobs > 0)
        .collect();

    Ok(GraphPlan {
        total_jobs: graph.len(),
        stages,
        jobs,
        frontier: graph.frontier().iter().map(|t| t.to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryStore;
    use crate::computation::{ComputeRequest, Computation};
    use crate::config::IterationConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingComputation {
        calls: Mutex<Vec<String>>,
    }

    impl Computation for CountingComputation {
        fn compute(&self, request: &ComputeRequest) -> Result<()> {
            self.calls.lock().unwrap().push(request.task.to_string());
            Ok(())
        }
    }

    fn isv_context(parallel: usize) -> (RunContext, Arc<CountingComputation>) {
        let mut config = PipelineConfig::new("/tmp/gridchain-unit");
        config.parallel = Some(parallel);
        config.stages = Some(vec![Stage::Isv]);
        config.training.isv = IterationConfig { total: 2, start: 0 };

        let store = MemoryStore::new();
        store.set_list("train_projector", (0..4).map(|i| format!("f{i}")).collect());
        let computation = Arc::new(CountingComputation::default());
        let ctx = RunContext::from_config(config, None)
            .with_store(Arc::new(store))
            .with_computation(computation.clone())
            .with_dry_run(false);
        (ctx, computation)
    }

    #[test]
    fn missing_backend_selection_is_fatal_before_graph() {
        let mut config = PipelineConfig::new("/tmp/gridchain-unit");
        config.skip = vec!["not-a-stage".to_string()];
        let ctx = RunContext::from_config(config, None);
        let err = run(&ctx, &RunRequest::default()).unwrap_err();
        assert_eq!(err.code.as_str(), "config.missing_key");
    }

    #[test]
    fn sub_task_path_runs_exactly_one_job() {
        let (ctx, computation) = isv_context(2);
        let request = RunRequest {
            sub_task: Some(SubTask::IsvMStep { iteration: 1 }),
        };

        match run(&ctx, &request).unwrap() {
            RunOutput::SubTask(report) => {
                assert_eq!(report.job, "isv-m-step.1");
                assert_eq!(report.outcome, UnitOutcome::Computed);
            }
            RunOutput::Graph(_) => panic!("expected sub-task output"),
        }
        assert_eq!(*computation.calls.lock().unwrap(), vec!["isv-m-step.1"]);
    }

    #[test]
    fn unhandled_sub_task_is_configuration_error() {
        let (ctx, _) = isv_context(2);
        let chain = DispatcherChain::new(Vec::new());
        let err = execute_sub_task(&ctx, &chain, &SubTask::SaveProjector).unwrap_err();
        assert_eq!(err.code.as_str(), "config.unknown_sub_task");
    }

    #[test]
    fn overall_status_follows_job_statuses() {
        let task = SubTask::SaveProjector;
        let with = |statuses: &[JobStatus]| -> Vec<JobReport> {
            statuses.iter().map(|&s| JobReport::new(&task, s)).collect()
        };

        assert_eq!(derive_overall_status(&with(&[])), RunStatus::Success);
        assert_eq!(
            derive_overall_status(&with(&[JobStatus::UpToDate, JobStatus::UpToDate])),
            RunStatus::UpToDate
        );
        assert_eq!(
            derive_overall_status(&with(&[JobStatus::Completed, JobStatus::DependencyFailed])),
            RunStatus::PartialSuccess
        );
        assert_eq!(
            derive_overall_status(&with(&[JobStatus::UpToDate, JobStatus::Failed])),
            RunStatus::Failed
        );
    }

    #[test]
    fn plan_lists_jobs_by_stage() {
        let (ctx, _) = isv_context(3);
        let plan = plan(&ctx.config).unwrap();
        assert_eq!(plan.total_jobs, 2 * 4);
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.frontier, vec!["isv-m-step.1"]);

        let m0 = plan.jobs.iter().find(|j| j.name == "isv-m-step.0").unwrap();
        assert_eq!(m0.queue, QueueClass::Training);
        assert_eq!(m0.dependencies.len(), 3);
    }
}
