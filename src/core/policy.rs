//! Skip/force decision for a single job.
//!
//! The decision is per shard: a half-finished sharded stage re-runs only
//! the shards whose outputs are missing.

use std::ops::Range;

use crate::artifacts::{expected_outputs, item_source, ArtifactStore, Outputs};
use crate::error::Result;
use crate::job::SubTask;
use crate::partition;

pub struct IdempotencePolicy<'a> {
    store: &'a dyn ArtifactStore,
}

impl<'a> IdempotencePolicy<'a> {
    pub fn new(store: &'a dyn ArtifactStore) -> Self {
        Self { store }
    }

    /// `true` when `force` is set or any expected output of this shard is missing.
    ///
    /// A shard whose range is empty has nothing to produce and never runs.
    pub fn should_run(&self, task: &SubTask, force: bool) -> Result<bool> {
        if force {
            return Ok(true);
        }

        let items = match item_source(task) {
            Some(_) => match self.shard_items(task)? {
                Some(items) => items,
                None => return Ok(false),
            },
            None => Vec::new(),
        };

        let missing = match expected_outputs(task) {
            Outputs::Keys(keys) => keys.is_empty() || keys.iter().any(|k| !self.store.exists(k)),
            Outputs::Items(_) => items.iter().any(|item| !self.store.exists(item)),
        };
        Ok(missing)
    }

    /// Item keys of this job's shard, or `None` when the shard has no items.
    pub fn shard_items(&self, task: &SubTask) -> Result<Option<Vec<String>>> {
        let source = match item_source(task) {
            Some(source) => source,
            None => return Ok(None),
        };
        let items = self.store.list(&source.category, &source.purpose)?;
        let range = match self.shard_range(task, items.len())? {
            Some(range) => range,
            None => return Ok(None),
        };
        Ok(Some(items[range].to_vec()))
    }

    /// Index range of this job's shard over a list of `total` items.
    pub fn shard_range(&self, task: &SubTask, total: usize) -> Result<Option<Range<usize>>> {
        match task.shard() {
            Some(shard) => partition::shard_range(total, shard.index, shard.count),
            None => Ok(Some(0..total)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryStore;
    use crate::job::Shard;

    fn store_with_items(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store.set_list("all", (0..n).map(|i| format!("utt-{i}")).collect());
        store
    }

    #[test]
    fn force_always_runs() {
        let store = store_with_items(4);
        for i in 0..4 {
            store.insert(format!("extracted/utt-{i}"));
        }
        store.insert("isv/iteration-0/model");
        let policy = IdempotencePolicy::new(&store);

        let tasks = [
            SubTask::Extract { shard: Shard::new(0, 2) },
            SubTask::IsvMStep { iteration: 0 },
        ];
        for task in &tasks {
            assert!(!policy.should_run(task, false).unwrap());
            assert!(policy.should_run(task, true).unwrap());
        }
    }

    #[test]
    fn decision_is_per_shard() {
        let store = store_with_items(4);
        store.insert("extracted/utt-0");
        store.insert("extracted/utt-1");
        store.insert("extracted/utt-2");
        let policy = IdempotencePolicy::new(&store);

        assert!(!policy.should_run(&SubTask::Extract { shard: Shard::new(0, 2) }, false).unwrap());
        assert!(policy.should_run(&SubTask::Extract { shard: Shard::new(1, 2) }, false).unwrap());
    }

    #[test]
    fn shard_past_clamp_has_nothing_to_do() {
        let store = store_with_items(2);
        let policy = IdempotencePolicy::new(&store);
        let task = SubTask::Extract { shard: Shard::new(3, 4) };
        assert!(!policy.should_run(&task, false).unwrap());
        assert!(policy.shard_items(&task).unwrap().is_none());
    }

    #[test]
    fn empty_estimation_shard_is_up_to_date() {
        let store = MemoryStore::new();
        store.set_list("train_projector", vec!["f0".to_string(), "f1".to_string()]);
        let policy = IdempotencePolicy::new(&store);

        let empty = SubTask::IsvEStep {
            iteration: 0,
            shard: Shard::new(2, 4),
        };
        let filled = SubTask::IsvEStep {
            iteration: 0,
            shard: Shard::new(1, 4),
        };
        assert!(!policy.should_run(&empty, false).unwrap());
        assert!(policy.should_run(&filled, false).unwrap());
    }

    #[test]
    fn statistics_from_another_split_do_not_count() {
        let store = MemoryStore::new();
        store.set_list("train_projector", (0..8).map(|i| format!("f{i}")).collect());
        store.insert("isv/iteration-0/stats-0-of-2");
        let policy = IdempotencePolicy::new(&store);

        let task = |count| SubTask::IsvEStep {
            iteration: 0,
            shard: Shard::new(0, count),
        };
        assert!(!policy.should_run(&task(2), false).unwrap());
        assert!(policy.should_run(&task(4), false).unwrap());
    }

    #[test]
    fn maximization_checks_its_own_model() {
        let store = MemoryStore::new();
        store.insert("gmm/iteration-0/model");
        let policy = IdempotencePolicy::new(&store);

        assert!(!policy.should_run(&SubTask::GmmMStep { iteration: 0 }, false).unwrap());
        assert!(policy.should_run(&SubTask::GmmMStep { iteration: 1 }, false).unwrap());
    }

    #[test]
    fn missing_item_list_propagates() {
        let store = MemoryStore::new();
        let policy = IdempotencePolicy::new(&store);
        assert!(policy
            .should_run(&SubTask::Project { shard: Shard::whole() }, false)
            .is_err());
    }
}
