use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::job::{Group, ResourceProfile, SUB_TASK_NAMES};
use crate::stage::{QueueClass, Stage, StageKind, SKIP_FLAGS};
use crate::utils::io;

/// Root configuration for one experiment (the JSON file passed to `--config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Experiment directory holding item lists and produced artifacts.
    pub artifacts: String,

    /// Enabled stages; all stages of the template when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<Stage>>,

    /// Skip flags (`kmeans`, `isv`, `score-computation`, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip: Vec<String>,

    #[serde(default)]
    pub force: bool,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default = "default_groups")]
    pub groups: Vec<Group>,

    #[serde(default)]
    pub zt_norm: bool,

    #[serde(default)]
    pub clean_intermediate: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridConfig>,

    /// Run locally with this many workers instead of submitting to a grid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<usize>,

    /// Command template per sub-task name.
    #[serde(default)]
    pub entry_points: BTreeMap<String, String>,

    /// Working directory for entry point commands; the experiment directory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationConfig {
    /// Total number of training iterations.
    pub total: u32,
    /// First iteration to schedule. Earlier iterations are assumed complete.
    #[serde(default)]
    pub start: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingConfig {
    #[serde(default = "default_kmeans_iterations")]
    pub kmeans: IterationConfig,

    #[serde(default = "default_gmm_iterations")]
    pub gmm: IterationConfig,

    #[serde(default = "default_isv_iterations")]
    pub isv: IterationConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            kmeans: default_kmeans_iterations(),
            gmm: default_gmm_iterations(),
            isv: default_isv_iterations(),
        }
    }
}

/// Number of parallel jobs per class. Unset classes fall back to `parallel`, then 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardCounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessing: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring: Option<usize>,
}

impl ShardCounts {
    pub fn get(&self, class: QueueClass) -> Option<usize> {
        match class {
            QueueClass::Preprocessing => self.preprocessing,
            QueueClass::Extraction => self.extraction,
            QueueClass::Projection => self.projection,
            QueueClass::Enrollment => self.enrollment,
            QueueClass::Scoring => self.scoring,
            QueueClass::Training => Some(1),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit: Option<SubmitConfig>,

    #[serde(default)]
    pub queues: BTreeMap<QueueClass, ResourceProfile>,

    #[serde(default)]
    pub jobs: ShardCounts,

    /// First handle handed out in dry-run mode.
    #[serde(default)]
    pub first_fake_job_id: u64,
}

/// How to talk to the batch engine's submit command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitConfig {
    /// Template, e.g. `qsub -terse -N {{name}} {{waitFor}} -q {{queue}} {{command}}`.
    pub command: String,

    /// Regex whose first capture group is the engine's job id in the submit output.
    #[serde(default = "default_handle_pattern")]
    pub handle_pattern: String,

    #[serde(default = "default_dependency_option")]
    pub dependency_option: String,

    #[serde(default = "default_dependency_separator")]
    pub dependency_separator: String,

    /// Binary re-invoked by submitted jobs; the running executable when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ExecutionMode {
    Remote,
    LocalSerial,
    LocalScheduler { workers: usize },
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_groups() -> Vec<Group> {
    vec![Group::Dev]
}

fn default_kmeans_iterations() -> IterationConfig {
    IterationConfig { total: 25, start: 0 }
}

fn default_gmm_iterations() -> IterationConfig {
    IterationConfig { total: 25, start: 0 }
}

fn default_isv_iterations() -> IterationConfig {
    IterationConfig { total: 10, start: 0 }
}

fn default_handle_pattern() -> String {
    r"(\d+)".to_string()
}

fn default_dependency_option() -> String {
    "-hold_jid".to_string()
}

fn default_dependency_separator() -> String {
    ",".to_string()
}

impl PipelineConfig {
    /// Minimal configuration rooted at `artifacts`; everything else at defaults.
    pub fn new(artifacts: impl Into<String>) -> Self {
        Self {
            artifacts: artifacts.into(),
            stages: None,
            skip: Vec::new(),
            force: false,
            dry_run: false,
            training: TrainingConfig::default(),
            groups: default_groups(),
            zt_norm: false,
            clean_intermediate: false,
            grid: None,
            parallel: None,
            entry_points: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = io::read_file(path, &format!("read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::config_invalid_json(path.display().to_string(), e))
    }

    pub fn artifacts_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.artifacts).to_string())
    }

    pub fn working_dir(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => self.artifacts_root(),
        }
    }

    /// Backend selection. Missing grid/parallel selection is fatal.
    pub fn execution_mode(&self) -> Result<ExecutionMode> {
        match (self.parallel, &self.grid) {
            (Some(0), _) => Err(Error::config_invalid_value(
                "parallel",
                Some("0".to_string()),
                "Worker count must be at least 1",
            )),
            (Some(1), _) => Ok(ExecutionMode::LocalSerial),
            (Some(workers), _) => Ok(ExecutionMode::LocalScheduler { workers }),
            (None, Some(_)) => Ok(ExecutionMode::Remote),
            (None, None) => Err(Error::config_missing_key("grid", None).with_hint(
                "To run the toolchain, either the 'grid' or the 'parallel' option needs to be specified",
            )),
        }
    }

    pub fn is_skipped(&self, stage: Stage) -> bool {
        self.skip.iter().any(|flag| flag == stage.skip_flag())
    }

    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.stages
            .as_ref()
            .is_none_or(|stages| stages.contains(&stage))
    }

    /// Enabled and not skipped: the stage contributes jobs.
    pub fn is_active(&self, stage: Stage) -> bool {
        self.is_enabled(stage) && !self.is_skipped(stage)
    }

    pub fn iterations(&self, stage: Stage) -> Option<IterationConfig> {
        match stage {
            Stage::Kmeans => Some(self.training.kmeans),
            Stage::Gmm => Some(self.training.gmm),
            Stage::Isv => Some(self.training.isv),
            _ => None,
        }
    }

    pub fn shard_count(&self, class: QueueClass) -> usize {
        self.grid
            .as_ref()
            .and_then(|grid| grid.jobs.get(class))
            .or(self.parallel)
            .unwrap_or(1)
    }

    pub fn stage_shards(&self, stage: Stage) -> usize {
        stage
            .shard_class()
            .map(|class| self.shard_count(class))
            .unwrap_or(1)
    }

    pub fn resource(&self, class: QueueClass) -> ResourceProfile {
        self.grid
            .as_ref()
            .and_then(|grid| grid.queues.get(&class))
            .cloned()
            .unwrap_or_default()
    }

    /// Reject invalid or contradictory settings before any graph is built.
    pub fn validate(&self) -> Result<()> {
        for flag in &self.skip {
            if !SKIP_FLAGS.contains(&flag.as_str()) {
                return Err(Error::validation_invalid_argument(
                    "skip",
                    format!("Unknown skip flag '{}'", flag),
                    Some(flag.clone()),
                    Some(SKIP_FLAGS.iter().map(|s| s.to_string()).collect()),
                ));
            }
        }

        for name in self.entry_points.keys() {
            if !SUB_TASK_NAMES.contains(&name.as_str()) {
                return Err(Error::config_invalid_value(
                    format!("entryPoints.{}", name),
                    None,
                    "Not a known sub-task name",
                ));
            }
        }

        for class in [
            QueueClass::Preprocessing,
            QueueClass::Extraction,
            QueueClass::Projection,
            QueueClass::Enrollment,
            QueueClass::Scoring,
        ] {
            if self.shard_count(class) == 0 {
                return Err(Error::config_invalid_value(
                    format!("grid.jobs.{}", class.as_str()),
                    Some("0".to_string()),
                    "Number of parallel jobs must be at least 1",
                ));
            }
        }

        for stage in Stage::ALL {
            if stage.kind() != StageKind::Iterative || !self.is_active(stage) {
                continue;
            }
            if let Some(iterations) = self.iterations(stage) {
                if iterations.total <= iterations.start {
                    return Err(Error::config_invalid_value(
                        format!("training.{}", stage.as_str()),
                        Some(format!("total={} start={}", iterations.total, iterations.start)),
                        format!(
                            "No {} iterations left to run; skip the stage with '{}' instead",
                            stage.as_str(),
                            stage.skip_flag()
                        ),
                    ));
                }
            }
        }

        let uses_groups = [
            Stage::Enrollment,
            Stage::ScoreComputation,
            Stage::Concatenation,
            Stage::Calibration,
        ]
        .iter()
        .any(|stage| self.is_active(*stage));
        if uses_groups && self.groups.is_empty() {
            return Err(Error::config_invalid_value(
                "groups",
                None,
                "At least one group is required for enrollment and scoring",
            ));
        }

        Ok(())
    }
}
