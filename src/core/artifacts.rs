//! Artifact store: item lists and produced outputs.
//!
//! The store is keyed by strings like `extracted/utt-0042` or
//! `isv/iteration-3/model`. The graph never touches it; only the
//! idempotence policy and the dispatchers do.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::job::{ModelType, ScoreType, SubTask};
use crate::utils::io;

pub trait ArtifactStore: Send + Sync {
    fn exists(&self, key: &str) -> bool;

    /// Ordered item keys of `purpose`, placed under `category`.
    fn list(&self, category: &str, purpose: &str) -> Result<Vec<String>>;
}

/// Store backed by the experiment directory.
///
/// Item lists live in `<root>/lists/<purpose>.lst`, one item per line
/// (blank lines and `#` comments ignored). Artifact `<key>` is the path
/// `<root>/<key>`.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn list_path(&self, purpose: &str) -> PathBuf {
        self.root.join("lists").join(format!("{}.lst", purpose))
    }
}

impl ArtifactStore for DirectoryStore {
    fn exists(&self, key: &str) -> bool {
        self.path_of(key).exists()
    }

    fn list(&self, category: &str, purpose: &str) -> Result<Vec<String>> {
        let path = self.list_path(purpose);
        let raw = io::read_file_optional(&path, &format!("read item list {}", path.display()))?
            .ok_or_else(|| {
                Error::config_missing_key(format!("lists/{}", purpose), Some(path.display().to_string()))
                    .with_hint(format!(
                        "Create {} with one item per line",
                        path.display()
                    ))
            })?;

        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|item| format!("{}/{}", category, item))
            .collect())
    }
}

/// In-memory store for embedding callers and tests.
#[derive(Default)]
pub struct MemoryStore {
    lists: Mutex<BTreeMap<String, Vec<String>>>,
    present: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_list(&self, purpose: &str, items: Vec<String>) {
        if let Ok(mut lists) = self.lists.lock() {
            lists.insert(purpose.to_string(), items);
        }
    }

    pub fn insert(&self, key: impl Into<String>) {
        if let Ok(mut present) = self.present.lock() {
            present.insert(key.into());
        }
    }
}

impl ArtifactStore for MemoryStore {
    fn exists(&self, key: &str) -> bool {
        self.present
            .lock()
            .map(|present| present.contains(key))
            .unwrap_or(false)
    }

    fn list(&self, category: &str, purpose: &str) -> Result<Vec<String>> {
        let lists = self
            .lists
            .lock()
            .map_err(|_| Error::internal_unexpected("Artifact list lock poisoned"))?;
        let items = lists.get(purpose).ok_or_else(|| {
            Error::config_missing_key(format!("lists/{}", purpose), None)
        })?;
        Ok(items
            .iter()
            .map(|item| format!("{}/{}", category, item))
            .collect())
    }
}

/// Item list a sharded sub-task works through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSource {
    /// Where the job writes one artifact per item.
    pub category: String,
    /// Which list the items come from.
    pub purpose: String,
}

impl ItemSource {
    fn new(category: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            purpose: purpose.into(),
        }
    }
}

/// What a sub-task must leave behind for it to count as done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outputs {
    /// One artifact per item in the shard's range of the list.
    Items(ItemSource),
    /// Fixed artifact keys.
    Keys(Vec<String>),
}

pub fn item_source(task: &SubTask) -> Option<ItemSource> {
    let source = match task {
        SubTask::Preprocess { .. } => ItemSource::new("preprocessed", "all"),
        SubTask::Extract { .. } => ItemSource::new("extracted", "all"),
        SubTask::NormalizeFeatures { .. } => ItemSource::new("normalized", "train_projector"),
        SubTask::KmeansEStep { .. } | SubTask::GmmEStep { .. } => {
            ItemSource::new("normalized", "train_projector")
        }
        SubTask::GmmProject { .. } => ItemSource::new("projected_gmm", "train_projector"),
        SubTask::IsvEStep { .. } => ItemSource::new("projected_gmm", "train_projector"),
        SubTask::Project { .. } => ItemSource::new("projected", "all"),
        SubTask::Enroll {
            group, model_type, ..
        } => match model_type {
            ModelType::N => ItemSource::new("models", format!("{}_models", group.as_str())),
            ModelType::T => ItemSource::new("tmodels", format!("{}_tmodels", group.as_str())),
        },
        SubTask::ComputeScores {
            group, score_type, ..
        } => {
            let category = format!("scores-{}", score_type.as_str());
            match score_type {
                ScoreType::A | ScoreType::B | ScoreType::Z => {
                    ItemSource::new(category, format!("{}_models", group.as_str()))
                }
                ScoreType::C | ScoreType::D => {
                    ItemSource::new(category, format!("{}_tmodels", group.as_str()))
                }
            }
        }
        _ => return None,
    };
    Some(source)
}

/// Key prefix of one training loop iteration.
fn iteration_dir(task: &SubTask) -> Option<String> {
    let family = match task {
        SubTask::KmeansEStep { .. } | SubTask::KmeansMStep { .. } => "kmeans",
        SubTask::GmmEStep { .. } | SubTask::GmmMStep { .. } => "gmm",
        SubTask::IsvEStep { .. } | SubTask::IsvMStep { .. } => "isv",
        _ => return None,
    };
    task.iteration()
        .map(|iteration| format!("{}/iteration-{}", family, iteration))
}

pub fn expected_outputs(task: &SubTask) -> Outputs {
    match task {
        SubTask::KmeansEStep { shard, .. }
        | SubTask::GmmEStep { shard, .. }
        | SubTask::IsvEStep { shard, .. } => match iteration_dir(task) {
            Some(dir) => Outputs::Keys(vec![format!(
                "{}/stats-{}-of-{}",
                dir, shard.index, shard.count
            )]),
            None => Outputs::Keys(Vec::new()),
        },
        SubTask::KmeansMStep { .. } | SubTask::GmmMStep { .. } | SubTask::IsvMStep { .. } => {
            match iteration_dir(task) {
                Some(dir) => Outputs::Keys(vec![format!("{}/model", dir)]),
                None => Outputs::Keys(Vec::new()),
            }
        }
        SubTask::TrainExtractor => Outputs::Keys(vec!["extractor".to_string()]),
        SubTask::KmeansInit => Outputs::Keys(vec!["kmeans/init".to_string()]),
        SubTask::GmmInit => Outputs::Keys(vec!["gmm/init".to_string()]),
        SubTask::SaveProjector => Outputs::Keys(vec!["projector".to_string()]),
        SubTask::Concatenate { group } => {
            Outputs::Keys(vec![format!("scores/{}/concatenated", group.as_str())])
        }
        SubTask::Calibrate { group } => {
            Outputs::Keys(vec![format!("scores/{}/calibrated", group.as_str())])
        }
        other => match item_source(other) {
            Some(source) => Outputs::Items(source),
            None => Outputs::Keys(Vec::new()),
        },
    }
}
