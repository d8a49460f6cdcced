//! Durable state for the tern harness.
//!
//! Everything here is plain filesystem I/O: versioned checkpoints written
//! with temp-file-and-rename, append-only journals for the execution log
//! and checkpoint history, job records for cross-process inspection, and
//! the lock file that keeps a project to one running harness.

pub mod atomic;
pub mod checkpoint;
pub mod config;
pub mod jobs;
pub mod lock;
pub mod models;

pub use checkpoint::{CheckpointLoad, CheckpointStore, HistoryEntry};
pub use config::StoreConfig;
pub use jobs::JobStore;
pub use lock::{LockError, RunLock};

use std::path::PathBuf;

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
