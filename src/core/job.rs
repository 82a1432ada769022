//! Job model: the tagged sub-task identity and the schedulable job node.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stage::Stage;

/// Shard `index` of `count` (zero-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shard {
    pub index: usize,
    pub count: usize,
}

impl Shard {
    pub fn new(index: usize, count: usize) -> Self {
        Self { index, count }
    }

    /// The whole item list as one shard.
    pub fn whole() -> Self {
        Self { index: 0, count: 1 }
    }

    /// Parse `i/K` as used by `--shard`.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |problem: &str| {
            Error::validation_invalid_argument("shard", problem, Some(value.to_string()), None)
                .with_hint("Use the form <index>/<count>, e.g. --shard 2/8")
        };

        let (index, count) = value
            .split_once('/')
            .ok_or_else(|| invalid("Expected <index>/<count>"))?;
        let index: usize = index
            .trim()
            .parse()
            .map_err(|_| invalid("Shard index is not a number"))?;
        let count: usize = count
            .trim()
            .parse()
            .map_err(|_| invalid("Shard count is not a number"))?;

        if count == 0 {
            return Err(invalid("Shard count must be at least 1"));
        }
        if index >= count {
            return Err(invalid("Shard index must be below the shard count"));
        }

        Ok(Self { index, count })
    }
}

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Dev,
    Eval,
}

impl Group {
    pub fn as_str(&self) -> &'static str {
        match self {
            Group::Dev => "dev",
            Group::Eval => "eval",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "dev" => Ok(Group::Dev),
            "eval" => Ok(Group::Eval),
            other => Err(Error::validation_invalid_argument(
                "group",
                "Unknown group",
                Some(other.to_string()),
                Some(vec!["dev".to_string(), "eval".to_string()]),
            )),
        }
    }
}

/// Enrolled model kind: normal client models or T-norm cohort models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelType {
    N,
    T,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::N => "N",
            ModelType::T => "T",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "N" => Ok(ModelType::N),
            "T" => Ok(ModelType::T),
            other => Err(Error::validation_invalid_argument(
                "model-type",
                "Unknown model type",
                Some(other.to_string()),
                Some(vec!["N".to_string(), "T".to_string()]),
            )),
        }
    }
}

/// Score matrix kind for ZT-normalization (A: raw, B/C/D: cohort, Z: Z-norm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScoreType {
    A,
    B,
    C,
    D,
    Z,
}

impl ScoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreType::A => "A",
            ScoreType::B => "B",
            ScoreType::C => "C",
            ScoreType::D => "D",
            ScoreType::Z => "Z",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "A" => Ok(ScoreType::A),
            "B" => Ok(ScoreType::B),
            "C" => Ok(ScoreType::C),
            "D" => Ok(ScoreType::D),
            "Z" => Ok(ScoreType::Z),
            other => Err(Error::validation_invalid_argument(
                "score-type",
                "Unknown score type",
                Some(other.to_string()),
                Some(["A", "B", "C", "D", "Z"].iter().map(|s| s.to_string()).collect()),
            )),
        }
    }
}

/// Identity and command of one job.
///
/// This is both the graph key and the re-invocation payload: the remote
/// backend renders it with [`SubTask::to_args`] and the re-entered process
/// rebuilds it with [`SubTask::from_args`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "subTask", rename_all = "kebab-case")]
pub enum SubTask {
    Preprocess { shard: Shard },
    TrainExtractor,
    Extract { shard: Shard },
    NormalizeFeatures { shard: Shard },
    KmeansInit,
    KmeansEStep { iteration: u32, shard: Shard },
    KmeansMStep { iteration: u32 },
    GmmInit,
    GmmEStep { iteration: u32, shard: Shard },
    GmmMStep { iteration: u32 },
    GmmProject { shard: Shard },
    IsvEStep { iteration: u32, shard: Shard },
    IsvMStep { iteration: u32 },
    SaveProjector,
    Project { shard: Shard },
    Enroll { group: Group, model_type: ModelType, shard: Shard },
    ComputeScores { group: Group, score_type: ScoreType, shard: Shard },
    Concatenate { group: Group },
    Calibrate { group: Group },
}

pub const SUB_TASK_NAMES: &[&str] = &[
    "preprocess",
    "train-extractor",
    "extract",
    "normalize-features",
    "kmeans-init",
    "kmeans-e-step",
    "kmeans-m-step",
    "gmm-init",
    "gmm-e-step",
    "gmm-m-step",
    "gmm-project",
    "isv-e-step",
    "isv-m-step",
    "save-projector",
    "project",
    "enroll",
    "compute-scores",
    "concatenate",
    "calibrate",
];

/// Raw `--sub-task` selector as it arrives from the command line.
#[derive(Debug, Clone, Default)]
pub struct SubTaskArgs {
    pub name: String,
    pub iteration: Option<u32>,
    pub shard: Option<Shard>,
    pub group: Option<Group>,
    pub model_type: Option<ModelType>,
    pub score_type: Option<ScoreType>,
}

impl SubTask {
    pub fn name(&self) -> &'static str {
        match self {
            SubTask::Preprocess { .. } => "preprocess",
            SubTask::TrainExtractor => "train-extractor",
            SubTask::Extract { .. } => "extract",
            SubTask::NormalizeFeatures { .. } => "normalize-features",
            SubTask::KmeansInit => "kmeans-init",
            SubTask::KmeansEStep { .. } => "kmeans-e-step",
            SubTask::KmeansMStep { .. } => "kmeans-m-step",
            SubTask::GmmInit => "gmm-init",
            SubTask::GmmEStep { .. } => "gmm-e-step",
            SubTask::GmmMStep { .. } => "gmm-m-step",
            SubTask::GmmProject { .. } => "gmm-project",
            SubTask::IsvEStep { .. } => "isv-e-step",
            SubTask::IsvMStep { .. } => "isv-m-step",
            SubTask::SaveProjector => "save-projector",
            SubTask::Project { .. } => "project",
            SubTask::Enroll { .. } => "enroll",
            SubTask::ComputeScores { .. } => "compute-scores",
            SubTask::Concatenate { .. } => "concatenate",
            SubTask::Calibrate { .. } => "calibrate",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            SubTask::Preprocess { .. } => Stage::Preprocessing,
            SubTask::TrainExtractor => Stage::ExtractorTraining,
            SubTask::Extract { .. } => Stage::Extraction,
            SubTask::NormalizeFeatures { .. } => Stage::Normalization,
            SubTask::KmeansInit => Stage::KmeansInit,
            SubTask::KmeansEStep { .. } | SubTask::KmeansMStep { .. } => Stage::Kmeans,
            SubTask::GmmInit => Stage::GmmInit,
            SubTask::GmmEStep { .. } | SubTask::GmmMStep { .. } => Stage::Gmm,
            SubTask::GmmProject { .. } => Stage::GmmProjection,
            SubTask::IsvEStep { .. } | SubTask::IsvMStep { .. } => Stage::Isv,
            SubTask::SaveProjector => Stage::SaveProjector,
            SubTask::Project { .. } => Stage::Projection,
            SubTask::Enroll { .. } => Stage::Enrollment,
            SubTask::ComputeScores { .. } => Stage::ScoreComputation,
            SubTask::Concatenate { .. } => Stage::Concatenation,
            SubTask::Calibrate { .. } => Stage::Calibration,
        }
    }

    pub fn iteration(&self) -> Option<u32> {
        match self {
            SubTask::KmeansEStep { iteration, .. }
            | SubTask::KmeansMStep { iteration }
            | SubTask::GmmEStep { iteration, .. }
            | SubTask::GmmMStep { iteration }
            | SubTask::IsvEStep { iteration, .. }
            | SubTask::IsvMStep { iteration } => Some(*iteration),
            _ => None,
        }
    }

    pub fn shard(&self) -> Option<Shard> {
        match self {
            SubTask::Preprocess { shard }
            | SubTask::Extract { shard }
            | SubTask::NormalizeFeatures { shard }
            | SubTask::KmeansEStep { shard, .. }
            | SubTask::GmmEStep { shard, .. }
            | SubTask::GmmProject { shard }
            | SubTask::IsvEStep { shard, .. }
            | SubTask::Project { shard }
            | SubTask::Enroll { shard, .. }
            | SubTask::ComputeScores { shard, .. } => Some(*shard),
            _ => None,
        }
    }

    pub fn group(&self) -> Option<Group> {
        match self {
            SubTask::Enroll { group, .. }
            | SubTask::ComputeScores { group, .. }
            | SubTask::Concatenate { group }
            | SubTask::Calibrate { group } => Some(*group),
            _ => None,
        }
    }

    /// Variant tag (group plus model/score type) for display and templating.
    pub fn variant(&self) -> Option<String> {
        match self {
            SubTask::Enroll {
                group, model_type, ..
            } => Some(format!("{}-{}", group.as_str(), model_type.as_str())),
            SubTask::ComputeScores {
                group, score_type, ..
            } => Some(format!("{}-{}", group.as_str(), score_type.as_str())),
            SubTask::Concatenate { group } | SubTask::Calibrate { group } => {
                Some(group.as_str().to_string())
            }
            _ => None,
        }
    }

    pub fn is_maximization(&self) -> bool {
        matches!(
            self,
            SubTask::KmeansMStep { .. } | SubTask::GmmMStep { .. } | SubTask::IsvMStep { .. }
        )
    }

    /// Arguments that make a re-invoked process execute exactly this job.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--sub-task".to_string(), self.name().to_string()];

        if let Some(iteration) = self.iteration() {
            args.push("--iteration".to_string());
            args.push(iteration.to_string());
        }
        if let Some(shard) = self.shard() {
            args.push("--shard".to_string());
            args.push(shard.to_string());
        }
        if let Some(group) = self.group() {
            args.push("--group".to_string());
            args.push(group.as_str().to_string());
        }
        match self {
            SubTask::Enroll { model_type, .. } => {
                args.push("--model-type".to_string());
                args.push(model_type.as_str().to_string());
            }
            SubTask::ComputeScores { score_type, .. } => {
                args.push("--score-type".to_string());
                args.push(score_type.as_str().to_string());
            }
            _ => {}
        }

        args
    }

    pub fn from_args(args: &SubTaskArgs) -> Result<Self> {
        let shard = args.shard.unwrap_or_else(Shard::whole);
        let iteration = || {
            args.iteration
                .ok_or_else(|| Error::validation_missing_argument(vec!["--iteration".to_string()]))
        };
        let group = || {
            args.group
                .ok_or_else(|| Error::validation_missing_argument(vec!["--group".to_string()]))
        };

        let task = match args.name.as_str() {
            "preprocess" => SubTask::Preprocess { shard },
            "train-extractor" => SubTask::TrainExtractor,
            "extract" => SubTask::Extract { shard },
            "normalize-features" => SubTask::NormalizeFeatures { shard },
            "kmeans-init" => SubTask::KmeansInit,
            "kmeans-e-step" => SubTask::KmeansEStep {
                iteration: iteration()?,
                shard,
            },
            "kmeans-m-step" => SubTask::KmeansMStep {
                iteration: iteration()?,
            },
            "gmm-init" => SubTask::GmmInit,
            "gmm-e-step" => SubTask::GmmEStep {
                iteration: iteration()?,
                shard,
            },
            "gmm-m-step" => SubTask::GmmMStep {
                iteration: iteration()?,
            },
            "gmm-project" => SubTask::GmmProject { shard },
            "isv-e-step" => SubTask::IsvEStep {
                iteration: iteration()?,
                shard,
            },
            "isv-m-step" => SubTask::IsvMStep {
                iteration: iteration()?,
            },
            "save-projector" => SubTask::SaveProjector,
            "project" => SubTask::Project { shard },
            "enroll" => SubTask::Enroll {
                group: group()?,
                model_type: args.model_type.ok_or_else(|| {
                    Error::validation_missing_argument(vec!["--model-type".to_string()])
                })?,
                shard,
            },
            "compute-scores" => SubTask::ComputeScores {
                group: group()?,
                score_type: args.score_type.ok_or_else(|| {
                    Error::validation_missing_argument(vec!["--score-type".to_string()])
                })?,
                shard,
            },
            "concatenate" => SubTask::Concatenate { group: group()? },
            "calibrate" => SubTask::Calibrate { group: group()? },
            other => return Err(Error::config_unknown_sub_task(other, SUB_TASK_NAMES)),
        };

        Ok(task)
    }
}

impl std::fmt::Display for SubTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(iteration) = self.iteration() {
            write!(f, ".{}", iteration)?;
        }
        if let Some(variant) = self.variant() {
            write!(f, ".{}", variant)?;
        }
        if let Some(shard) = self.shard() {
            if shard.count > 1 {
                write!(f, ".shard-{}-of-{}", shard.index, shard.count)?;
            }
        }
        Ok(())
    }
}

/// Queue/memory/time class passed through to the backend untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default)]
    pub io_big: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// Opaque token for a submitted (remote) or completed (local) job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub task: SubTask,
    pub name: String,
    pub shard_count: usize,
    pub resource: ResourceProfile,
    pub dependencies: Vec<SubTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle: Option<Handle>,
}

impl Job {
    pub fn new(task: SubTask, resource: ResourceProfile, dependencies: Vec<SubTask>) -> Self {
        let shard_count = task.shard().map(|s| s.count).unwrap_or(1);
        Self {
            name: task.to_string(),
            task,
            shard_count,
            resource,
            dependencies,
            handle: None,
        }
    }

    pub fn id(&self) -> &SubTask {
        &self.task
    }

    pub fn handle(&self) -> Option<&Handle> {
        self.handle.as_ref()
    }

    /// Record the backend's handle. A job is submitted at most once.
    pub fn assign_handle(&mut self, handle: Handle) -> Result<()> {
        if let Some(existing) = &self.handle {
            return Err(Error::internal_unexpected(format!(
                "Job '{}' already has handle '{}'",
                self.name, existing
            )));
        }
        self.handle = Some(handle);
        Ok(())
    }
}
