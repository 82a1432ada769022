use std::sync::{Arc, Mutex};

use gridchain::artifacts::{expected_outputs, ArtifactStore, MemoryStore, Outputs};
use gridchain::backend::{BatchEngine, RemoteBackend, SerialBackend, SubmitRequest};
use gridchain::computation::{ComputeRequest, Computation};
use gridchain::config::{GridConfig, IterationConfig, PipelineConfig};
use gridchain::context::RunContext;
use gridchain::dispatch::DispatcherChain;
use gridchain::error::{ComputationFailedDetails, SubmissionRejectedDetails};
use gridchain::graph;
use gridchain::job::{Group, Handle, Shard, SubTask};
use gridchain::orchestrator::{
    self, InPlaceRunner, JobStatus, RunOutput, RunReport, RunRequest, RunStatus,
};
use gridchain::stage::Stage;
use gridchain::{Error, ErrorCode, Result};

/// Computation fake that writes each job's expected outputs into the store.
struct MaterializingComputation {
    store: Arc<MemoryStore>,
    calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
}

impl MaterializingComputation {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    fn failing_on(store: Arc<MemoryStore>, job: &str) -> Self {
        Self {
            fail_on: Some(job.to_string()),
            ..Self::new(store)
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Computation for MaterializingComputation {
    fn compute(&self, request: &ComputeRequest) -> Result<()> {
        let job = request.task.to_string();
        self.calls.lock().unwrap().push(job.clone());

        if self.fail_on.as_deref() == Some(job.as_str()) {
            return Err(Error::computation_failed(ComputationFailedDetails {
                job,
                entry_point: request.entry_point.clone(),
                exit_code: Some(1),
                stderr: "diverged".to_string(),
            }));
        }

        match expected_outputs(&request.task) {
            Outputs::Keys(keys) => keys.into_iter().for_each(|k| self.store.insert(k)),
            Outputs::Items(source) => {
                let items = self.store.list(&source.category, &source.purpose)?;
                let range = request.range.clone().unwrap_or(0..items.len());
                for item in &items[range] {
                    self.store.insert(item.clone());
                }
            }
        }
        Ok(())
    }
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.set_list("all", (0..6).map(|i| format!("utt-{i}")).collect());
    store.set_list("train_projector", (0..4).map(|i| format!("utt-{i}")).collect());
    store.set_list("dev_models", (1..=3).map(|i| format!("m-{i}")).collect());
    Arc::new(store)
}

/// Fresh experiment directory; graph runs write their run info there.
fn scratch_dir() -> String {
    std::env::temp_dir()
        .join(format!("gridchain-orchestration-{}", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string()
}

fn shard_name(base: &str, index: usize, count: usize) -> String {
    if count > 1 {
        format!("{base}.shard-{index}-of-{count}")
    } else {
        base.to_string()
    }
}

fn toolchain_config(parallel: usize) -> PipelineConfig {
    let mut config = PipelineConfig::new(scratch_dir());
    config.parallel = Some(parallel);
    config.skip = vec![
        "preprocessing".to_string(),
        "extractor-training".to_string(),
        "calibration".to_string(),
    ];
    config.training.kmeans = IterationConfig { total: 2, start: 0 };
    config.training.gmm = IterationConfig { total: 2, start: 0 };
    config.training.isv = IterationConfig { total: 3, start: 0 };
    config
}

fn context(
    config: PipelineConfig,
    store: Arc<MemoryStore>,
    computation: Arc<MaterializingComputation>,
) -> RunContext {
    RunContext::from_config(config, None)
        .with_store(store)
        .with_computation(computation)
}

fn graph_report(output: RunOutput) -> RunReport {
    match output {
        RunOutput::Graph(report) => report,
        RunOutput::SubTask(_) => panic!("expected a graph run"),
    }
}

fn status_of(report: &RunReport, job: &str) -> JobStatus {
    report
        .job(job)
        .unwrap_or_else(|| panic!("no job {job}"))
        .status
}

#[test]
fn second_run_performs_zero_computations() {
    for parallel in [1, 3] {
        let store = seeded_store();
        let first = Arc::new(MaterializingComputation::new(store.clone()));
        let ctx = context(toolchain_config(parallel), store.clone(), first.clone());

        let report = graph_report(orchestrator::run(&ctx, &RunRequest::default()).unwrap());
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.summary.completed, report.jobs.len());
        assert_eq!(first.calls().len(), report.jobs.len());
        assert!(report.handles.is_empty());

        let second = Arc::new(MaterializingComputation::new(store.clone()));
        let ctx = context(toolchain_config(parallel), store, second.clone());
        let report = graph_report(orchestrator::run(&ctx, &RunRequest::default()).unwrap());

        assert_eq!(report.status, RunStatus::UpToDate);
        assert_eq!(report.summary.up_to_date, report.jobs.len());
        assert!(second.calls().is_empty(), "parallel={parallel}");
    }
}

#[test]
fn force_recomputes_existing_outputs() {
    let store = seeded_store();
    let warmup = Arc::new(MaterializingComputation::new(store.clone()));
    let ctx = context(toolchain_config(1), store.clone(), warmup);
    orchestrator::run(&ctx, &RunRequest::default()).unwrap();

    let forced = Arc::new(MaterializingComputation::new(store.clone()));
    let ctx = context(toolchain_config(1), store, forced.clone()).with_force(true);
    let report = graph_report(orchestrator::run(&ctx, &RunRequest::default()).unwrap());

    assert_eq!(report.summary.completed, report.jobs.len());
    assert_eq!(forced.calls().len(), report.jobs.len());
}

#[test]
fn half_finished_stage_reruns_only_missing_shards() {
    let store = seeded_store();
    let mut config = PipelineConfig::new(scratch_dir());
    config.parallel = Some(3);
    config.stages = Some(vec![Stage::Extraction]);
    // shard 0 of 3 covers utt-0 and utt-1
    store.insert("extracted/utt-0");
    store.insert("extracted/utt-1");

    let computation = Arc::new(MaterializingComputation::new(store.clone()));
    let ctx = context(config, store, computation.clone());
    let report = graph_report(orchestrator::run(&ctx, &RunRequest::default()).unwrap());

    assert_eq!(status_of(&report, "extract.shard-0-of-3"), JobStatus::UpToDate);
    assert_eq!(status_of(&report, "extract.shard-1-of-3"), JobStatus::Completed);
    let mut calls = computation.calls();
    calls.sort();
    assert_eq!(calls, vec!["extract.shard-1-of-3", "extract.shard-2-of-3"]);
}

#[test]
fn failed_m_step_blocks_only_its_successors() {
    for parallel in [1, 2] {
        let store = seeded_store();
        let computation = Arc::new(MaterializingComputation::failing_on(
            store.clone(),
            "isv-m-step.1",
        ));
        let ctx = context(toolchain_config(parallel), store, computation.clone());
        let report = graph_report(orchestrator::run(&ctx, &RunRequest::default()).unwrap());

        assert_eq!(report.status, RunStatus::PartialSuccess);
        assert_eq!(report.failure_code(), Some(ErrorCode::ComputationFailed));

        let m1 = report.job("isv-m-step.1").unwrap();
        assert_eq!(m1.status, JobStatus::Failed);
        assert!(m1.error.as_deref().unwrap().contains("isv-m-step.1"));

        for done in [
            "gmm-m-step.1".to_string(),
            shard_name("gmm-project", parallel - 1, parallel),
            shard_name("isv-e-step.1", 0, parallel),
            "isv-m-step.0".to_string(),
        ] {
            assert_eq!(status_of(&report, &done), JobStatus::Completed, "{done}");
        }
        for blocked in [
            shard_name("isv-e-step.2", 0, parallel),
            "isv-m-step.2".to_string(),
            "save-projector".to_string(),
            shard_name("project", 0, parallel),
            "concatenate.dev".to_string(),
        ] {
            assert_eq!(
                status_of(&report, &blocked),
                JobStatus::DependencyFailed,
                "{blocked} parallel={parallel}"
            );
        }

        let m2 = report.job("isv-m-step.2").unwrap();
        assert_eq!(m2.error_code, Some(ErrorCode::JobDependencyFailed));
        assert!(m2
            .error
            .as_deref()
            .unwrap()
            .contains("'isv-m-step.2' not run: dependency"));

        let calls = computation.calls();
        assert!(!calls.iter().any(|c| c.starts_with("isv-e-step.2")));
        assert!(!calls.iter().any(|c| c == "save-projector"));

        if parallel == 1 {
            assert_eq!(calls.last().map(String::as_str), Some("isv-m-step.1"));
            let failed_at = report.jobs.iter().position(|j| j.job == "isv-m-step.1").unwrap();
            assert!(report.jobs[failed_at + 1..]
                .iter()
                .all(|j| matches!(j.status, JobStatus::DependencyFailed | JobStatus::NotSubmitted)));
        }
    }
}

#[test]
fn serial_failure_stops_sibling_shards() {
    let store = seeded_store();
    let mut config = PipelineConfig::new(scratch_dir());
    config.parallel = Some(3);
    config.stages = Some(vec![Stage::Extraction]);
    let computation = Arc::new(MaterializingComputation::failing_on(
        store.clone(),
        "extract.shard-0-of-3",
    ));
    let ctx = context(config, store, computation.clone());

    let mut graph = graph::build(&ctx.config).unwrap();
    let runner = Arc::new(InPlaceRunner::new(ctx.clone(), Arc::new(DispatcherChain::isv())));
    let mut backend = SerialBackend::new(runner);
    let report =
        orchestrator::submit_graph(&ctx, &mut graph, &mut backend, "serial-run".to_string()).unwrap();

    assert_eq!(computation.calls(), vec!["extract.shard-0-of-3"]);
    assert_eq!(status_of(&report, "extract.shard-0-of-3"), JobStatus::Failed);
    assert_eq!(status_of(&report, "extract.shard-1-of-3"), JobStatus::NotSubmitted);
    assert_eq!(status_of(&report, "extract.shard-2-of-3"), JobStatus::NotSubmitted);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failure_code(), Some(ErrorCode::ComputationFailed));
}

#[test]
fn shards_beyond_item_count_are_up_to_date() {
    let store = MemoryStore::new();
    store.set_list("train_projector", vec!["utt-0".to_string(), "utt-1".to_string()]);
    let store = Arc::new(store);

    let run_once = || {
        let mut config = PipelineConfig::new(scratch_dir());
        config.parallel = Some(4);
        config.stages = Some(vec![Stage::Isv]);
        config.training.isv = IterationConfig { total: 1, start: 0 };
        let computation = Arc::new(MaterializingComputation::new(store.clone()));
        let ctx = context(config, store.clone(), computation.clone());
        let report = graph_report(orchestrator::run(&ctx, &RunRequest::default()).unwrap());
        (report, computation.calls())
    };

    let (first, mut calls) = run_once();
    calls.sort();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(
        calls,
        vec!["isv-e-step.0.shard-0-of-4", "isv-e-step.0.shard-1-of-4", "isv-m-step.0"]
    );
    assert_eq!(status_of(&first, "isv-e-step.0.shard-2-of-4"), JobStatus::UpToDate);
    assert_eq!(status_of(&first, "isv-e-step.0.shard-3-of-4"), JobStatus::UpToDate);

    let (second, calls) = run_once();
    assert_eq!(second.status, RunStatus::UpToDate);
    assert_eq!(second.summary.up_to_date, 5);
    assert!(calls.is_empty());
}

#[test]
fn rerun_after_failure_resumes_at_failed_job() {
    let store = seeded_store();
    let failing = Arc::new(MaterializingComputation::failing_on(store.clone(), "isv-m-step.1"));
    let ctx = context(toolchain_config(1), store.clone(), failing);
    orchestrator::run(&ctx, &RunRequest::default()).unwrap();

    let retry = Arc::new(MaterializingComputation::new(store.clone()));
    let ctx = context(toolchain_config(1), store, retry.clone());
    let report = graph_report(orchestrator::run(&ctx, &RunRequest::default()).unwrap());

    assert_eq!(report.status, RunStatus::Success);
    let calls = retry.calls();
    assert_eq!(calls.first().map(String::as_str), Some("isv-m-step.1"));
    assert!(!calls.iter().any(|c| c.starts_with("gmm")));
}

#[test]
fn sub_task_path_skips_up_to_date_job() {
    let store = seeded_store();
    store.insert("isv/iteration-4/stats-1-of-2");
    let computation = Arc::new(MaterializingComputation::new(store.clone()));
    let ctx = context(toolchain_config(2), store, computation.clone());

    let request = RunRequest {
        sub_task: Some(SubTask::IsvEStep {
            iteration: 4,
            shard: Shard::new(1, 2),
        }),
    };
    match orchestrator::run(&ctx, &request).unwrap() {
        RunOutput::SubTask(report) => {
            assert_eq!(report.outcome, gridchain::backend::UnitOutcome::UpToDate)
        }
        RunOutput::Graph(_) => panic!("expected sub-task output"),
    }
    assert!(computation.calls().is_empty());
}

#[test]
fn configuration_errors_abort_before_any_computation() {
    let store = seeded_store();
    let computation = Arc::new(MaterializingComputation::new(store.clone()));
    let mut config = toolchain_config(2);
    config.training.isv = IterationConfig { total: 3, start: 3 };
    let ctx = context(config, store, computation.clone());

    let err = orchestrator::run(&ctx, &RunRequest::default()).unwrap_err();
    assert!(err.code.is_configuration());
    assert!(computation.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Remote backend
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct FakeEngine {
    submitted: Arc<Mutex<Vec<SubmitRequest>>>,
    reject: Option<String>,
}

impl BatchEngine for FakeEngine {
    fn submit(&mut self, request: &SubmitRequest) -> Result<Handle> {
        if self.reject.as_deref() == Some(request.name.as_str()) {
            return Err(Error::submission_rejected(SubmissionRejectedDetails {
                job: request.name.clone(),
                command: "qsub".to_string(),
                exit_code: Some(1),
                output: "Unable to run job: queue disabled".to_string(),
            }));
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(request.clone());
        Ok(Handle::new((100 + submitted.len()).to_string()))
    }
}

fn remote_run(config: PipelineConfig, store: Arc<MemoryStore>, engine: FakeEngine) -> RunReport {
    let computation = Arc::new(MaterializingComputation::new(store.clone()));
    let ctx = context(config, store, computation.clone());
    let mut graph = graph::build(&ctx.config).unwrap();
    let mut backend = RemoteBackend::new(
        Box::new(engine),
        vec!["gridchain".to_string(), "run".to_string()],
    );

    let report =
        orchestrator::submit_graph(&ctx, &mut graph, &mut backend, "test-run".to_string()).unwrap();
    assert!(computation.calls().is_empty(), "remote runs never compute in place");
    report
}

fn isv_grid_config() -> PipelineConfig {
    let mut config = PipelineConfig::new(scratch_dir());
    config.grid = Some(GridConfig::default());
    config.grid.as_mut().unwrap().jobs.projection = Some(2);
    config.stages = Some(vec![Stage::Isv]);
    config.training.isv = IterationConfig { total: 2, start: 0 };
    config
}

#[test]
fn remote_waits_for_predecessor_handles() {
    let engine = FakeEngine::default();
    let report = remote_run(isv_grid_config(), seeded_store(), engine.clone());

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.summary.submitted, 6);
    assert_eq!(report.handles.len(), 6);
    assert_eq!(report.handles["isv-m-step.0"], Handle::new("103"));

    let submitted = engine.submitted.lock().unwrap();
    let request = |name: &str| submitted.iter().find(|r| r.name == name).unwrap().clone();

    assert!(request("isv-e-step.0.shard-0-of-2").dependencies.is_empty());
    assert_eq!(
        request("isv-m-step.0").dependencies,
        vec![Handle::new("101"), Handle::new("102")]
    );
    assert_eq!(
        request("isv-e-step.1.shard-1-of-2").dependencies,
        vec![Handle::new("103")]
    );
    assert_eq!(
        &request("isv-m-step.1").command[2..],
        &["--sub-task", "isv-m-step", "--iteration", "1"]
    );
}

#[test]
fn remote_up_to_date_jobs_are_not_submitted() {
    let store = seeded_store();
    store.insert("isv/iteration-0/stats-0-of-2");
    store.insert("isv/iteration-0/stats-1-of-2");
    store.insert("isv/iteration-0/model");

    let engine = FakeEngine::default();
    let report = remote_run(isv_grid_config(), store, engine.clone());

    assert_eq!(report.summary.up_to_date, 3);
    assert_eq!(report.summary.submitted, 3);
    assert!(report.job("isv-m-step.0").unwrap().handle.is_none());

    let submitted = engine.submitted.lock().unwrap();
    let e1 = submitted
        .iter()
        .find(|r| r.name == "isv-e-step.1.shard-0-of-2")
        .unwrap();
    assert!(e1.dependencies.is_empty());
}

#[test]
fn rejected_submission_stops_the_sequence() {
    let mut config = isv_grid_config();
    config.stages = Some(vec![Stage::Isv, Stage::Concatenation]);
    config.groups = vec![Group::Dev, Group::Eval];

    let engine = FakeEngine {
        reject: Some("isv-m-step.0".to_string()),
        ..Default::default()
    };
    let report = remote_run(config, seeded_store(), engine.clone());

    assert_eq!(report.status, RunStatus::PartialSuccess);
    assert_eq!(report.failure_code(), Some(ErrorCode::SubmissionRejected));
    assert_eq!(status_of(&report, "isv-e-step.0.shard-1-of-2"), JobStatus::Submitted);
    assert_eq!(status_of(&report, "isv-m-step.0"), JobStatus::Failed);
    assert_eq!(
        status_of(&report, "isv-e-step.1.shard-0-of-2"),
        JobStatus::DependencyFailed
    );
    assert_eq!(status_of(&report, "concatenate.eval"), JobStatus::DependencyFailed);
    assert_eq!(engine.submitted.lock().unwrap().len(), 2);
}

#[test]
fn rejection_marks_independent_jobs_not_submitted() {
    let mut config = PipelineConfig::new(scratch_dir());
    config.grid = Some(GridConfig::default());
    config.stages = Some(vec![Stage::Concatenation]);
    config.groups = vec![Group::Dev, Group::Eval];

    let engine = FakeEngine {
        reject: Some("concatenate.dev".to_string()),
        ..Default::default()
    };
    let report = remote_run(config, seeded_store(), engine);

    assert_eq!(status_of(&report, "concatenate.dev"), JobStatus::Failed);
    assert_eq!(status_of(&report, "concatenate.eval"), JobStatus::NotSubmitted);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.summary.not_submitted, 1);
}

#[test]
fn dry_run_hands_out_fake_ids() {
    let store = seeded_store();
    let computation = Arc::new(MaterializingComputation::new(store.clone()));
    let mut config = isv_grid_config();
    config.grid.as_mut().unwrap().first_fake_job_id = 5000;
    let ctx = context(config, store, computation.clone()).with_dry_run(true);

    let report = graph_report(orchestrator::run(&ctx, &RunRequest::default()).unwrap());

    assert!(report.dry_run);
    assert_eq!(report.handles["isv-e-step.0.shard-0-of-2"], Handle::new("5000"));
    assert_eq!(report.handles["isv-m-step.1"], Handle::new("5005"));
    assert!(computation.calls().is_empty());
}
