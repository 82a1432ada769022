//! Local backends: run jobs in this process.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use super::{CompletedJob, ExecutionBackend, JobOutcome, JobRunner};
use crate::error::{Error, Result};
use crate::job::{Handle, Job, SubTask};

fn local_handle(counter: &mut u64) -> Handle {
    *counter += 1;
    Handle::new(format!("local-{}", counter))
}

/// Runs each job to completion inside `submit`.
///
/// The orchestrator submits in topological order, so every dependency has
/// finished by the time a job is submitted.
pub struct SerialBackend {
    runner: Arc<dyn JobRunner>,
    counter: u64,
}

impl SerialBackend {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self { runner, counter: 0 }
    }
}

impl ExecutionBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "local-serial"
    }

    fn is_local(&self) -> bool {
        true
    }

    fn completes_on_submit(&self) -> bool {
        true
    }

    fn submit(&mut self, job: &Job, _dependencies: &[Handle]) -> Result<Handle> {
        log_status!("local", "Running {}", job.name);
        self.runner.run_job(&job.task)?;
        Ok(local_handle(&mut self.counter))
    }
}

struct QueuedJob {
    task: SubTask,
    waits_for: Vec<SubTask>,
}

/// Queues jobs at `submit` and runs them in `complete()`, at most
/// `workers` at a time, each only after all of its dependencies succeeded.
pub struct SchedulerBackend {
    runner: Arc<dyn JobRunner>,
    workers: usize,
    queued: Vec<QueuedJob>,
    tasks_by_handle: HashMap<Handle, SubTask>,
    counter: u64,
}

impl SchedulerBackend {
    pub fn new(runner: Arc<dyn JobRunner>, workers: usize) -> Self {
        Self {
            runner,
            workers: workers.max(1),
            queued: Vec::new(),
            tasks_by_handle: HashMap::new(),
            counter: 0,
        }
    }
}

impl ExecutionBackend for SchedulerBackend {
    fn name(&self) -> &'static str {
        "local-scheduler"
    }

    fn is_local(&self) -> bool {
        true
    }

    fn submit(&mut self, job: &Job, dependencies: &[Handle]) -> Result<Handle> {
        let waits_for = dependencies
            .iter()
            .map(|handle| {
                self.tasks_by_handle.get(handle).cloned().ok_or_else(|| {
                    Error::internal_unexpected(format!(
                        "Job '{}' waits for handle '{}' this scheduler never issued",
                        job.name, handle
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let handle = local_handle(&mut self.counter);
        self.tasks_by_handle.insert(handle.clone(), job.task.clone());
        self.queued.push(QueuedJob {
            task: job.task.clone(),
            waits_for,
        });
        Ok(handle)
    }

    fn complete(&mut self) -> Result<Vec<CompletedJob>> {
        let mut pending = std::mem::take(&mut self.queued);
        let mut succeeded: HashMap<SubTask, bool> = HashMap::new();
        let mut completed = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            let (ready, blocked, skipped) = split_ready(pending, &mut succeeded);
            completed.extend(skipped);

            if ready.is_empty() {
                if blocked.is_empty() {
                    break;
                }
                let names: Vec<String> = blocked.iter().map(|q| q.task.to_string()).collect();
                return Err(Error::internal_unexpected(format!(
                    "Jobs blocked on dependencies that never ran: {}",
                    names.join(", ")
                )));
            }

            for batch in ready.chunks(self.workers) {
                for result in execute_batch(batch, Arc::clone(&self.runner))? {
                    let ok = matches!(result.outcome, JobOutcome::Succeeded(_));
                    succeeded.insert(result.task.clone(), ok);
                    completed.push(result);
                }
            }

            pending = blocked;
        }

        Ok(completed)
    }
}

/// Partition pending jobs into ready, still blocked, and doomed by a failed dependency.
fn split_ready(
    pending: Vec<QueuedJob>,
    succeeded: &mut HashMap<SubTask, bool>,
) -> (Vec<SubTask>, Vec<QueuedJob>, Vec<CompletedJob>) {
    let mut ready = Vec::new();
    let mut blocked = Vec::new();
    let mut skipped = Vec::new();

    for queued in pending {
        let mut unmet = false;
        let mut failed_dependency: Option<SubTask> = None;

        for dep in &queued.waits_for {
            match succeeded.get(dep) {
                Some(true) => {}
                Some(false) => {
                    failed_dependency = Some(dep.clone());
                    break;
                }
                None => unmet = true,
            }
        }

        if let Some(dep) = failed_dependency {
            succeeded.insert(queued.task.clone(), false);
            skipped.push(CompletedJob {
                task: queued.task,
                outcome: JobOutcome::DependencyFailed(dep),
            });
            continue;
        }

        if unmet {
            blocked.push(queued);
        } else {
            ready.push(queued.task);
        }
    }

    (ready, blocked, skipped)
}

fn execute_batch(tasks: &[SubTask], runner: Arc<dyn JobRunner>) -> Result<Vec<CompletedJob>> {
    if tasks.len() <= 1 {
        return Ok(tasks
            .iter()
            .map(|task| execute_single(task.clone(), runner.as_ref()))
            .collect());
    }

    let handles: Vec<_> = tasks
        .iter()
        .map(|task| {
            let task = task.clone();
            let runner = Arc::clone(&runner);
            thread::spawn(move || execute_single(task, runner.as_ref()))
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for handle in handles {
        results.push(
            handle
                .join()
                .map_err(|_| Error::internal_unexpected("Job execution thread panicked"))?,
        );
    }
    Ok(results)
}

fn execute_single(task: SubTask, runner: &dyn JobRunner) -> CompletedJob {
    log_status!("local", "Running {}", task);
    let outcome = match runner.run_job(&task) {
        Ok(unit) => JobOutcome::Succeeded(unit),
        Err(err) => JobOutcome::Failed(err),
    };
    CompletedJob { task, outcome }
}
