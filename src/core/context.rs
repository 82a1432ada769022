//! Run context: everything one orchestration run shares.
//!
//! Built once at startup and passed explicitly to the dispatchers and the
//! backend; nothing in the crate reads global state.

use std::path::PathBuf;
use std::sync::Arc;

use crate::artifacts::{ArtifactStore, DirectoryStore};
use crate::computation::{CommandComputation, Computation};
use crate::config::PipelineConfig;
use crate::policy::IdempotencePolicy;

#[derive(Clone)]
pub struct RunContext {
    pub config: PipelineConfig,
    /// Configuration file, handed to re-invoked processes.
    pub config_path: Option<PathBuf>,
    pub store: Arc<dyn ArtifactStore>,
    pub computation: Arc<dyn Computation>,
    pub force: bool,
    pub dry_run: bool,
}

impl RunContext {
    /// Context backed by the experiment directory and the configured entry points.
    pub fn from_config(config: PipelineConfig, config_path: Option<PathBuf>) -> Self {
        let store: Arc<dyn ArtifactStore> = Arc::new(DirectoryStore::new(config.artifacts_root()));
        let computation: Arc<dyn Computation> = Arc::new(CommandComputation::from_config(&config));
        Self {
            force: config.force,
            dry_run: config.dry_run,
            config,
            config_path,
            store,
            computation,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_computation(mut self, computation: Arc<dyn Computation>) -> Self {
        self.computation = computation;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn policy(&self) -> IdempotencePolicy<'_> {
        IdempotencePolicy::new(self.store.as_ref())
    }
}
