//! Stage registry: the canonical ISV toolchain template.
//!
//! Stages are listed in the order the graph builder visits them. Several
//! stages share a skip flag (e.g. `kmeans-init` and `kmeans` are both
//! skipped by `kmeans`), matching the `--skip-*` switches of the toolchain.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Preprocessing,
    ExtractorTraining,
    Extraction,
    Normalization,
    KmeansInit,
    Kmeans,
    GmmInit,
    Gmm,
    GmmProjection,
    Isv,
    SaveProjector,
    Projection,
    Enrollment,
    ScoreComputation,
    Concatenation,
    Calibration,
}

/// How a stage expands into jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// One job (or one per group for per-group stages).
    Single,
    /// One job per shard (and per variant, where the stage has variants).
    Sharded,
    /// Expectation shards + one maximization job, repeated per iteration.
    Iterative,
}

/// Parallelism and queue classes from the grid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Preprocessing,
    Extraction,
    Training,
    Projection,
    Enrollment,
    Scoring,
}

pub const SKIP_FLAGS: &[&str] = &[
    "preprocessing",
    "extractor-training",
    "extraction",
    "normalization",
    "kmeans",
    "gmm",
    "isv",
    "projection",
    "enrollment",
    "score-computation",
    "concatenation",
    "calibration",
];

impl Stage {
    pub const ALL: [Stage; 16] = [
        Stage::Preprocessing,
        Stage::ExtractorTraining,
        Stage::Extraction,
        Stage::Normalization,
        Stage::KmeansInit,
        Stage::Kmeans,
        Stage::GmmInit,
        Stage::Gmm,
        Stage::GmmProjection,
        Stage::Isv,
        Stage::SaveProjector,
        Stage::Projection,
        Stage::Enrollment,
        Stage::ScoreComputation,
        Stage::Concatenation,
        Stage::Calibration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preprocessing => "preprocessing",
            Stage::ExtractorTraining => "extractor-training",
            Stage::Extraction => "extraction",
            Stage::Normalization => "normalization",
            Stage::KmeansInit => "kmeans-init",
            Stage::Kmeans => "kmeans",
            Stage::GmmInit => "gmm-init",
            Stage::Gmm => "gmm",
            Stage::GmmProjection => "gmm-projection",
            Stage::Isv => "isv",
            Stage::SaveProjector => "save-projector",
            Stage::Projection => "projection",
            Stage::Enrollment => "enrollment",
            Stage::ScoreComputation => "score-computation",
            Stage::Concatenation => "concatenation",
            Stage::Calibration => "calibration",
        }
    }

    pub fn parse(value: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    pub fn skip_flag(&self) -> &'static str {
        match self {
            Stage::KmeansInit | Stage::Kmeans => "kmeans",
            Stage::GmmInit | Stage::Gmm => "gmm",
            Stage::GmmProjection | Stage::Isv | Stage::SaveProjector => "isv",
            other => other.as_str(),
        }
    }

    pub fn kind(&self) -> StageKind {
        match self {
            Stage::ExtractorTraining
            | Stage::KmeansInit
            | Stage::GmmInit
            | Stage::SaveProjector
            | Stage::Concatenation
            | Stage::Calibration => StageKind::Single,
            Stage::Kmeans | Stage::Gmm | Stage::Isv => StageKind::Iterative,
            Stage::Preprocessing
            | Stage::Extraction
            | Stage::Normalization
            | Stage::GmmProjection
            | Stage::Projection
            | Stage::Enrollment
            | Stage::ScoreComputation => StageKind::Sharded,
        }
    }

    /// Class whose configured job count sets this stage's shard count.
    /// Iterative stages shard their expectation steps with it.
    pub fn shard_class(&self) -> Option<QueueClass> {
        match self {
            Stage::Preprocessing => Some(QueueClass::Preprocessing),
            Stage::Extraction | Stage::Normalization => Some(QueueClass::Extraction),
            Stage::Kmeans
            | Stage::Gmm
            | Stage::Isv
            | Stage::GmmProjection
            | Stage::Projection => Some(QueueClass::Projection),
            Stage::Enrollment => Some(QueueClass::Enrollment),
            Stage::ScoreComputation => Some(QueueClass::Scoring),
            _ => None,
        }
    }

    /// Queue for the stage's jobs. Maximization steps always use the training queue.
    pub fn queue(&self) -> QueueClass {
        self.shard_class().unwrap_or(QueueClass::Training)
    }
}

impl QueueClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Preprocessing => "preprocessing",
            QueueClass::Extraction => "extraction",
            QueueClass::Training => "training",
            QueueClass::Projection => "projection",
            QueueClass::Enrollment => "enrollment",
            QueueClass::Scoring => "scoring",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
