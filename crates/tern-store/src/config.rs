use std::env;
use std::path::{Path, PathBuf};

use crate::models::Mode;

/// Where a project's harness state lives on disk.
///
/// Reads the `TERN_STATE_DIR` environment variable, falling back to
/// `<project_dir>/.tern` when unset.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding checkpoints, journals, job records and the lock.
    pub state_dir: PathBuf,
}

impl StoreConfig {
    /// Name of the per-project state directory.
    pub const DEFAULT_DIR_NAME: &str = ".tern";

    /// Environment variable that overrides the state directory.
    pub const STATE_DIR_ENV: &str = "TERN_STATE_DIR";

    /// Build a config for a project directory, honoring `TERN_STATE_DIR`.
    pub fn for_project(project_dir: &Path) -> Self {
        match env::var(Self::STATE_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::new(project_dir.join(Self::DEFAULT_DIR_NAME)),
        }
    }

    /// Build a config from an explicit directory (useful for tests).
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn checkpoint_path(&self, mode: Mode) -> PathBuf {
        self.state_dir.join(format!("checkpoint-{mode}.json"))
    }

    pub fn log_path(&self, mode: Mode) -> PathBuf {
        self.state_dir.join(format!("log-{mode}.jsonl"))
    }

    pub fn history_path(&self, mode: Mode) -> PathBuf {
        self.state_dir.join(format!("history-{mode}.jsonl"))
    }

    pub fn outputs_dir(&self, mode: Mode) -> PathBuf {
        self.state_dir.join("outputs").join(mode.to_string())
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("run.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_scoped_by_mode() {
        let cfg = StoreConfig::new("/tmp/state");
        assert_eq!(
            cfg.checkpoint_path(Mode::Analyze),
            PathBuf::from("/tmp/state/checkpoint-analyze.json")
        );
        assert_eq!(
            cfg.log_path(Mode::Execute),
            PathBuf::from("/tmp/state/log-execute.jsonl")
        );
        assert_eq!(
            cfg.outputs_dir(Mode::Execute),
            PathBuf::from("/tmp/state/outputs/execute")
        );
        assert_eq!(cfg.lock_path(), PathBuf::from("/tmp/state/run.lock"));
    }

    #[test]
    fn explicit_new() {
        let cfg = StoreConfig::new("/var/lib/tern");
        assert_eq!(cfg.jobs_dir(), PathBuf::from("/var/lib/tern/jobs"));
    }
}
