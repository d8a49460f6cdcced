//! Versioned, checksummed checkpoints for a [`WorkflowRun`].
//!
//! Layout under the state directory, per mode:
//!
//! ```text
//! checkpoint-<mode>.json   envelope { version, sha256, saved_at, run }
//! log-<mode>.jsonl         execution log, one LogEntry per line
//! history-<mode>.jsonl     one HistoryEntry per save
//! outputs/<mode>/<step>.md provider output of completed steps
//! ```
//!
//! The checkpoint is replaced atomically on every save. The journals are
//! append-only; a torn trailing line left by a crash is skipped on read.

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::atomic::{append_line, remove_if_exists, write_atomic};
use crate::config::StoreConfig;
use crate::models::{LogEntry, Mode, WorkflowRun, WorkflowState};
use crate::StoreError;

/// Current checkpoint schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    sha256: String,
    saved_at: DateTime<Utc>,
    run: serde_json::Value,
}

/// Result of reading a checkpoint. Loading never fails outright: anything
/// unreadable is reported as [`CheckpointLoad::Corrupt`] so the caller can
/// start over.
#[derive(Debug)]
pub enum CheckpointLoad {
    /// No checkpoint has been written for this mode.
    Missing,
    /// A valid checkpoint, with its execution log re-attached.
    Found(Box<WorkflowRun>),
    /// The checkpoint exists but cannot be trusted.
    Corrupt(String),
}

/// One line of the checkpoint history journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub saved_at: DateTime<Utc>,
    pub state: WorkflowState,
    pub current_step_id: Option<String>,
    pub current_provider_id: Option<String>,
    pub completed: usize,
}

/// Filesystem-backed checkpoint store for one project.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    config: StoreConfig,
}

impl CheckpointStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read the checkpoint for `mode`.
    pub fn load(&self, mode: Mode) -> CheckpointLoad {
        let path = self.config.checkpoint_path(mode);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return CheckpointLoad::Missing,
            Err(e) => {
                return CheckpointLoad::Corrupt(format!("cannot read {}: {e}", path.display()));
            }
        };

        let mut run = match decode_envelope(&bytes) {
            Ok(run) => run,
            Err(reason) => {
                tracing::warn!(path = %path.display(), %reason, "checkpoint rejected");
                return CheckpointLoad::Corrupt(reason);
            }
        };

        if run.mode != mode {
            return CheckpointLoad::Corrupt(format!(
                "checkpoint at {} belongs to mode {}, expected {mode}",
                path.display(),
                run.mode
            ));
        }

        run.execution_log = self.read_log(mode);
        CheckpointLoad::Found(Box::new(run))
    }

    /// Atomically replace the checkpoint for `run.mode` and append a
    /// history line.
    pub fn save(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let path = self.config.checkpoint_path(run.mode);
        let bytes = encode_envelope(run)?;
        write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;

        let entry = HistoryEntry {
            saved_at: Utc::now(),
            state: run.state,
            current_step_id: run.current_step_id.clone(),
            current_provider_id: run.current_provider_id.clone(),
            completed: run.completed_steps.len(),
        };
        // History is informational; a failed append must not fail the save.
        match serde_json::to_string(&entry) {
            Ok(line) => {
                let history = self.config.history_path(run.mode);
                if let Err(e) = append_line(&history, &line) {
                    tracing::warn!(path = %history.display(), error = %e, "failed to append checkpoint history");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize history entry"),
        }

        Ok(())
    }

    /// Append an entry to the run's execution log.
    ///
    /// The entry is written to the journal first and only then pushed onto
    /// the in-memory log, so memory never shows an entry the disk lacks.
    pub fn append_log(&self, run: &mut WorkflowRun, entry: LogEntry) -> Result<(), StoreError> {
        let path = self.config.log_path(run.mode);
        let line = serde_json::to_string(&entry).map_err(|source| StoreError::Serialize {
            what: "log entry",
            source,
        })?;
        append_line(&path, &line).map_err(|e| StoreError::io(&path, e))?;
        run.execution_log.push(entry);
        Ok(())
    }

    /// Read the execution log journal, skipping unparsable lines.
    pub fn read_log(&self, mode: Mode) -> Vec<LogEntry> {
        read_journal(&self.config.log_path(mode))
    }

    /// Checkpoint history, oldest first. `limit` keeps only the newest N.
    pub fn history(&self, mode: Mode, limit: Option<usize>) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> = read_journal(&self.config.history_path(mode));
        if let Some(limit) = limit {
            let excess = entries.len().saturating_sub(limit);
            entries.drain(..excess);
        }
        entries
    }

    /// Remove the checkpoint and execution log, returning the mode to idle.
    /// History and step outputs are kept.
    pub fn reset(&self, mode: Mode) -> Result<(), StoreError> {
        for path in [self.config.checkpoint_path(mode), self.config.log_path(mode)] {
            remove_if_exists(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }

    /// Remove everything stored for `mode`, including history and outputs.
    pub fn clear(&self, mode: Mode) -> Result<(), StoreError> {
        self.reset(mode)?;
        let history = self.config.history_path(mode);
        remove_if_exists(&history).map_err(|e| StoreError::io(&history, e))?;
        let outputs = self.config.outputs_dir(mode);
        match fs::remove_dir_all(&outputs) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&outputs, e)),
        }
    }

    /// Persist a step's provider output and return where it was written.
    pub fn write_step_output(
        &self,
        mode: Mode,
        step_id: &str,
        content: &str,
    ) -> Result<PathBuf, StoreError> {
        let path = self.config.outputs_dir(mode).join(format!("{step_id}.md"));
        write_atomic(&path, content.as_bytes()).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }
}

fn digest(value: &serde_json::Value) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Serialize {
        what: "checkpoint",
        source,
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn encode_envelope(run: &WorkflowRun) -> Result<Vec<u8>, StoreError> {
    let value = serde_json::to_value(run).map_err(|source| StoreError::Serialize {
        what: "checkpoint",
        source,
    })?;
    let envelope = Envelope {
        version: CHECKPOINT_VERSION,
        sha256: digest(&value)?,
        saved_at: Utc::now(),
        run: value,
    };
    serde_json::to_vec_pretty(&envelope).map_err(|source| StoreError::Serialize {
        what: "checkpoint",
        source,
    })
}

fn decode_envelope(bytes: &[u8]) -> Result<WorkflowRun, String> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| format!("malformed checkpoint: {e}"))?;

    if envelope.version != CHECKPOINT_VERSION {
        return Err(format!(
            "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
            envelope.version
        ));
    }

    let actual = digest(&envelope.run).map_err(|e| e.to_string())?;
    if actual != envelope.sha256 {
        return Err("checkpoint digest mismatch".to_string());
    }

    serde_json::from_value(envelope.run).map_err(|e| format!("invalid checkpoint body: {e}"))
}

fn read_journal<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Vec<T> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read journal");
            return Vec::new();
        }
    };

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable journal line");
                None
            }
        })
        .collect()
}
