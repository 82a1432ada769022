//! Computation entry points.
//!
//! The statistics themselves live outside this crate. A [`Computation`]
//! receives one fully resolved request per job; [`CommandComputation`]
//! turns it into a shell command from the configured `entryPoints`.

use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::{ComputationFailedDetails, Error, Result};
use crate::job::{Group, ModelType, ScoreType, SubTask};
use crate::utils::command;
use crate::utils::shell;
use crate::utils::template::{self, TemplateVars};

/// Everything an entry point needs to run one job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeRequest {
    pub entry_point: String,
    pub task: SubTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// Item index range of the shard; `None` for jobs over the whole input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<ModelType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_type: Option<ScoreType>,
    /// Number of E-step shards an M-step merges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_jobs: Option<usize>,
    pub force: bool,
    pub clean_intermediate: bool,
}

impl ComputeRequest {
    pub fn new(task: &SubTask) -> Self {
        let (model_type, score_type) = match task {
            SubTask::Enroll { model_type, .. } => (Some(*model_type), None),
            SubTask::ComputeScores { score_type, .. } => (None, Some(*score_type)),
            _ => (None, None),
        };

        Self {
            entry_point: task.name().to_string(),
            task: task.clone(),
            iteration: task.iteration(),
            range: None,
            group: task.group(),
            model_type,
            score_type,
            parallel_jobs: None,
            force: false,
            clean_intermediate: false,
        }
    }

    pub fn with_range(mut self, range: Range<usize>) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_parallel_jobs(mut self, jobs: usize) -> Self {
        self.parallel_jobs = Some(jobs);
        self
    }

    pub fn with_flags(mut self, force: bool, clean_intermediate: bool) -> Self {
        self.force = force;
        self.clean_intermediate = clean_intermediate;
        self
    }
}

pub trait Computation: Send + Sync {
    fn compute(&self, request: &ComputeRequest) -> Result<()>;
}

/// Runs the `entryPoints` template of each request through `sh -c`.
pub struct CommandComputation {
    templates: HashMap<String, String>,
    working_dir: PathBuf,
    artifacts: PathBuf,
}

impl CommandComputation {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            templates: config
                .entry_points
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            working_dir: config.working_dir(),
            artifacts: config.artifacts_root(),
        }
    }

    pub fn render(&self, request: &ComputeRequest) -> Result<String> {
        let template = self.templates.get(&request.entry_point).ok_or_else(|| {
            Error::config_missing_key(format!("entryPoints.{}", request.entry_point), None)
                .with_hint(format!(
                    "Add a command template for '{}' to entryPoints",
                    request.entry_point
                ))
        })?;

        let rendered = template::render_map(template, &self.variables(request));
        let leftover = template::unresolved(&rendered);
        if !leftover.is_empty() {
            return Err(Error::config_invalid_value(
                format!("entryPoints.{}", request.entry_point),
                Some(template.clone()),
                format!(
                    "No value for {} in job {}",
                    leftover
                        .iter()
                        .map(|name| format!("{{{{{}}}}}", name))
                        .collect::<Vec<_>>()
                        .join(", "),
                    request.task
                ),
            ));
        }
        Ok(rendered)
    }

    fn variables(&self, request: &ComputeRequest) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        let mut set = |key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };

        set(
            TemplateVars::ARTIFACTS,
            shell::quote_path(&self.artifacts.to_string_lossy()),
        );
        set(TemplateVars::FORCE, flag(request.force, "--force"));
        set(
            TemplateVars::CLEAN,
            flag(request.clean_intermediate, "--clean-intermediate"),
        );
        if let Some(iteration) = request.iteration {
            set(TemplateVars::ITERATION, iteration.to_string());
        }
        if let Some(range) = &request.range {
            set(TemplateVars::START, range.start.to_string());
            set(TemplateVars::END, range.end.to_string());
        }
        if let Some(shard) = request.task.shard() {
            set(TemplateVars::SHARD, shard.index.to_string());
            set(TemplateVars::SHARDS, shard.count.to_string());
        } else if let Some(jobs) = request.parallel_jobs {
            set(TemplateVars::SHARDS, jobs.to_string());
        }
        if let Some(group) = request.group {
            set(TemplateVars::GROUP, group.as_str().to_string());
        }
        if let Some(model_type) = request.model_type {
            set(TemplateVars::MODEL_TYPE, model_type.as_str().to_string());
        }
        if let Some(score_type) = request.score_type {
            set(TemplateVars::SCORE_TYPE, score_type.as_str().to_string());
        }

        vars
    }
}

fn flag(enabled: bool, value: &str) -> String {
    if enabled {
        value.to_string()
    } else {
        String::new()
    }
}

impl Computation for CommandComputation {
    fn compute(&self, request: &ComputeRequest) -> Result<()> {
        let rendered = self.render(request)?;
        log_status!("compute", "{}: {}", request.task, rendered);

        let output = command::run_shell(
            &rendered,
            Some(&self.working_dir),
            &format!("entry point {}", request.entry_point),
        )?;

        if !output.success {
            return Err(Error::computation_failed(ComputationFailedDetails {
                job: request.task.to_string(),
                entry_point: request.entry_point.clone(),
                exit_code: output.exit_code,
                stderr: output.error_text().to_string(),
            }));
        }

        Ok(())
    }
}
