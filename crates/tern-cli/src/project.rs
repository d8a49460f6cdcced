//! The project a command operates on: its directory and state location.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use tern_core::config::HarnessConfig;
use tern_core::provider::ProviderRegistry;
use tern_core::{HarnessRunner, JobManager, StepCatalog, SystemClock};
use tern_store::models::Mode;
use tern_store::{CheckpointStore, JobStore, RunLock, StoreConfig};

#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub store: StoreConfig,
}

impl Project {
    /// Open `dir`, or the current directory when `None`.
    pub fn open(dir: Option<&Path>) -> Result<Self> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir().context("failed to read the current directory")?,
        };
        let dir = dir
            .canonicalize()
            .with_context(|| format!("project directory {} does not exist", dir.display()))?;
        let store = StoreConfig::for_project(&dir);
        Ok(Self { dir, store })
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.store.clone())
    }

    /// A job manager that sees records written by any harness process.
    pub fn jobs(&self) -> JobManager {
        JobManager::new(&self.dir).with_store(JobStore::new(&self.store))
    }

    pub fn catalog(&self, mode: Mode) -> Result<StepCatalog> {
        StepCatalog::load(&self.store.state_dir, mode).with_context(|| {
            format!(
                "failed to load the {mode} step catalog from {}",
                StepCatalog::override_path(&self.store.state_dir, mode).display()
            )
        })
    }

    pub fn runner(&self, mode: Mode, config: HarnessConfig) -> Result<HarnessRunner> {
        let catalog = self.catalog(mode)?;
        let registry = ProviderRegistry::from_config(&config);
        Ok(HarnessRunner::new(
            mode,
            &self.dir,
            config,
            catalog,
            self.checkpoints(),
            registry,
            Arc::new(SystemClock),
        ))
    }

    /// Take the single-harness lock for this project.
    pub fn lock(&self) -> Result<RunLock> {
        RunLock::acquire(&self.store.lock_path()).context("cannot lock the project")
    }
}
