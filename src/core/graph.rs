//! Job-graph construction.
//!
//! The builder walks the stage template in canonical order and threads a
//! *frontier* (the job ids the next created jobs must wait for) through it:
//!
//! - single-shot stages add one job per variant and become the frontier,
//! - sharded stages add one job per shard and variant; all of them become
//!   the frontier, so the next stage waits for every shard,
//! - iterative stages chain `E(i) shards -> M(i) -> E(i+1) shards -> ...`
//!   and leave the last maximization job as the frontier,
//! - skipped or disabled stages add nothing and leave the frontier alone.
//!
//! Jobs are stored in creation order, which is a topological order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::job::{Job, ModelType, ScoreType, Shard, SubTask};
use crate::stage::{QueueClass, Stage, StageKind};

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobGraph {
    jobs: Vec<Job>,
    #[serde(skip)]
    index: HashMap<SubTask, usize>,
    frontier: Vec<SubTask>,
}

impl JobGraph {
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &SubTask) -> Option<&Job> {
        self.index.get(id).map(|&idx| &self.jobs[idx])
    }

    pub fn get_mut(&mut self, id: &SubTask) -> Option<&mut Job> {
        self.index.get(id).map(|&idx| &mut self.jobs[idx])
    }

    pub fn jobs_by_name(&self) -> BTreeMap<&str, &Job> {
        self.jobs.iter().map(|job| (job.name.as_str(), job)).collect()
    }

    /// Jobs the next appended stage would depend on.
    pub fn frontier(&self) -> &[SubTask] {
        &self.frontier
    }

    pub fn jobs_of_stage(&self, stage: Stage) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(move |job| job.task.stage() == stage)
    }

    /// Every job that directly or indirectly waits for `id`.
    pub fn transitive_successors(&self, id: &SubTask) -> HashSet<SubTask> {
        let mut dependents: HashMap<&SubTask, Vec<&SubTask>> = HashMap::new();
        for job in &self.jobs {
            for dep in &job.dependencies {
                dependents.entry(dep).or_default().push(&job.task);
            }
        }

        let mut found = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for &child in dependents.get(current).into_iter().flatten() {
                if found.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }
        found
    }

    /// Kahn ordering over the declared dependencies.
    ///
    /// Fails when a dependency names an unknown job or the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<SubTask>> {
        let mut indegree = vec![0usize; self.jobs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.jobs.len()];

        for (idx, job) in self.jobs.iter().enumerate() {
            for dep in &job.dependencies {
                let parent_idx = self.index.get(dep).ok_or_else(|| {
                    Error::internal_unexpected(format!(
                        "Job '{}' depends on unknown job '{}'",
                        job.name, dep
                    ))
                })?;
                indegree[idx] += 1;
                dependents[*parent_idx].push(idx);
            }
        }

        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut ordered = Vec::with_capacity(self.jobs.len());
        while let Some(idx) = queue.pop_front() {
            ordered.push(self.jobs[idx].task.clone());
            for &child in &dependents[idx] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        if ordered.len() != self.jobs.len() {
            let pending: Vec<String> = self
                .jobs
                .iter()
                .enumerate()
                .filter(|(idx, _)| indegree[*idx] > 0)
                .map(|(_, job)| job.name.clone())
                .collect();
            return Err(Error::internal_unexpected(format!(
                "Job graph contains a cycle through: {}",
                pending.join(", ")
            )));
        }

        Ok(ordered)
    }

    fn push(&mut self, job: Job) -> Result<()> {
        if self.index.contains_key(&job.task) {
            return Err(Error::internal_unexpected(format!(
                "Duplicate job '{}'",
                job.name
            )));
        }
        self.index.insert(job.task.clone(), self.jobs.len());
        self.jobs.push(job);
        Ok(())
    }
}

/// Build the complete job graph for `config`.
///
/// Resuming with `start > 0` omits earlier iterations without checking
/// that their outputs exist; the idempotence policy and the caller own
/// that precondition.
pub fn build(config: &PipelineConfig) -> Result<JobGraph> {
    config.validate()?;

    let mut builder = GraphBuilder {
        config,
        graph: JobGraph::default(),
        frontier: Vec::new(),
    };

    for stage in Stage::ALL {
        if !config.is_active(stage) {
            continue;
        }
        builder.add_stage(stage)?;
    }

    let GraphBuilder {
        mut graph, frontier, ..
    } = builder;
    graph.frontier = frontier;
    Ok(graph)
}

struct GraphBuilder<'a> {
    config: &'a PipelineConfig,
    graph: JobGraph,
    frontier: Vec<SubTask>,
}

impl GraphBuilder<'_> {
    fn add_stage(&mut self, stage: Stage) -> Result<()> {
        match stage.kind() {
            StageKind::Single => self.add_single_stage(stage),
            StageKind::Sharded => self.add_sharded_stage(stage),
            StageKind::Iterative => self.add_iterative_stage(stage),
        }
    }

    fn add_single_stage(&mut self, stage: Stage) -> Result<()> {
        let tasks: Vec<SubTask> = match stage {
            Stage::ExtractorTraining => vec![SubTask::TrainExtractor],
            Stage::KmeansInit => vec![SubTask::KmeansInit],
            Stage::GmmInit => vec![SubTask::GmmInit],
            Stage::SaveProjector => vec![SubTask::SaveProjector],
            Stage::Concatenation => self
                .config
                .groups
                .iter()
                .map(|&group| SubTask::Concatenate { group })
                .collect(),
            Stage::Calibration => self
                .config
                .groups
                .iter()
                .map(|&group| SubTask::Calibrate { group })
                .collect(),
            other => {
                return Err(Error::internal_unexpected(format!(
                    "Stage '{}' is not single-shot",
                    other
                )))
            }
        };

        let deps = self.frontier.clone();
        let added = self.add_jobs(tasks, QueueClass::Training, &deps)?;
        self.frontier = added;
        Ok(())
    }

    fn add_sharded_stage(&mut self, stage: Stage) -> Result<()> {
        let count = self.config.stage_shards(stage);
        let shards: Vec<Shard> = (0..count).map(|index| Shard::new(index, count)).collect();

        let mut tasks = Vec::new();
        match stage {
            Stage::Preprocessing => {
                tasks.extend(shards.iter().map(|&shard| SubTask::Preprocess { shard }))
            }
            Stage::Extraction => {
                tasks.extend(shards.iter().map(|&shard| SubTask::Extract { shard }))
            }
            Stage::Normalization => tasks.extend(
                shards
                    .iter()
                    .map(|&shard| SubTask::NormalizeFeatures { shard }),
            ),
            Stage::GmmProjection => {
                tasks.extend(shards.iter().map(|&shard| SubTask::GmmProject { shard }))
            }
            Stage::Projection => {
                tasks.extend(shards.iter().map(|&shard| SubTask::Project { shard }))
            }
            Stage::Enrollment => {
                for &group in &self.config.groups {
                    for model_type in self.model_types() {
                        tasks.extend(shards.iter().map(|&shard| SubTask::Enroll {
                            group,
                            model_type,
                            shard,
                        }));
                    }
                }
            }
            Stage::ScoreComputation => {
                for &group in &self.config.groups {
                    for score_type in self.sharded_score_types() {
                        tasks.extend(shards.iter().map(|&shard| SubTask::ComputeScores {
                            group,
                            score_type,
                            shard,
                        }));
                    }
                    if self.config.zt_norm {
                        tasks.push(SubTask::ComputeScores {
                            group,
                            score_type: ScoreType::Z,
                            shard: Shard::whole(),
                        });
                    }
                }
            }
            other => {
                return Err(Error::internal_unexpected(format!(
                    "Stage '{}' is not sharded",
                    other
                )))
            }
        }

        let deps = self.frontier.clone();
        let added = self.add_jobs(tasks, stage.queue(), &deps)?;
        self.frontier = added;
        Ok(())
    }

    fn add_iterative_stage(&mut self, stage: Stage) -> Result<()> {
        let iterations = self.config.iterations(stage).ok_or_else(|| {
            Error::internal_unexpected(format!("Stage '{}' has no iteration settings", stage))
        })?;
        let count = self.config.stage_shards(stage);

        let mut deps = self.frontier.clone();
        for iteration in iterations.start..iterations.total {
            let e_steps: Vec<SubTask> = (0..count)
                .map(|index| {
                    let shard = Shard::new(index, count);
                    match stage {
                        Stage::Kmeans => SubTask::KmeansEStep { iteration, shard },
                        Stage::Gmm => SubTask::GmmEStep { iteration, shard },
                        _ => SubTask::IsvEStep { iteration, shard },
                    }
                })
                .collect();
            let e_ids = self.add_jobs(e_steps, stage.queue(), &deps)?;

            let m_step = match stage {
                Stage::Kmeans => SubTask::KmeansMStep { iteration },
                Stage::Gmm => SubTask::GmmMStep { iteration },
                _ => SubTask::IsvMStep { iteration },
            };
            deps = self.add_jobs(vec![m_step], QueueClass::Training, &e_ids)?;
        }

        self.frontier = deps;
        Ok(())
    }

    fn add_jobs(
        &mut self,
        tasks: Vec<SubTask>,
        queue: QueueClass,
        deps: &[SubTask],
    ) -> Result<Vec<SubTask>> {
        let resource = self.config.resource(queue);
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(task.clone());
            self.graph
                .push(Job::new(task, resource.clone(), deps.to_vec()))?;
        }
        Ok(ids)
    }

    fn model_types(&self) -> Vec<ModelType> {
        if self.config.zt_norm {
            vec![ModelType::N, ModelType::T]
        } else {
            vec![ModelType::N]
        }
    }

    fn sharded_score_types(&self) -> Vec<ScoreType> {
        if self.config.zt_norm {
            vec![ScoreType::A, ScoreType::B, ScoreType::C, ScoreType::D]
        } else {
            vec![ScoreType::A]
        }
    }
}
