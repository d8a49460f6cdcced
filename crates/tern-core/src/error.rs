//! Error taxonomy for the harness.
//!
//! | Error                 | Recovered by                                   |
//! |-----------------------|------------------------------------------------|
//! | `Transport`           | Error Handler (retry / switch / abort)         |
//! | `RateLimited`         | Error Handler (wait / switch)                  |
//! | `ProviderOutput`      | Error Handler (retry / switch / abort)         |
//! | `NoProviderAvailable` | Runner: pauses as `paused_rate_limited`        |
//! | `CorruptCheckpoint`   | Runner: starts a new run with a warning        |
//! | `DependencyUnmet`     | Returned to the caller, nothing is mutated     |
//!
//! Only the last three ever reach the CLI, and only `DependencyUnmet`
//! (plus configuration and persistence failures) as an `Err`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use tern_store::models::{FailureKind, Mode, WorkflowState};
use tern_store::StoreError;

/// Failure to reach a provider or to get a complete answer from it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to start provider command '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("provider I/O failed: {0}")]
    Io(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider call was cancelled")]
    Cancelled,

    #[error("provider worker crashed: {0}")]
    WorkerCrashed(String),
}

impl TransportError {
    /// Spawn failures mean the provider cannot work at all in this process.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("provider {provider_id} is rate limited; retry after {retry_after_secs}s")]
    RateLimited {
        provider_id: String,
        retry_after_secs: u64,
    },

    #[error("provider {provider_id} reported an error: {message}")]
    ProviderOutput { provider_id: String, message: String },

    #[error("no provider available{}", .resume_after.map(|t| format!(" until {}", t.to_rfc3339())).unwrap_or_default())]
    NoProviderAvailable { resume_after: Option<DateTime<Utc>> },

    #[error("checkpoint for {mode} is unreadable: {reason}")]
    CorruptCheckpoint { mode: Mode, reason: String },

    #[error("step {step_id} cannot run yet; unmet dependencies: {}", .missing.join(", "))]
    DependencyUnmet { step_id: String, missing: Vec<String> },

    #[error("unknown step {step_id} for mode {mode}")]
    UnknownStep { mode: Mode, step_id: String },

    #[error("unknown provider {0}")]
    UnknownProvider(String),

    #[error("invalid workflow transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HarnessError {
    /// Failure class recorded on the run for errors that stop a step.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) => FailureKind::Transport,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::ProviderOutput { .. } => FailureKind::ProviderOutput,
            Self::NoProviderAvailable { .. } => FailureKind::NoProviderAvailable,
            _ => FailureKind::Internal,
        }
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
