//! Core of the tern harness.
//!
//! The [`runner::HarnessRunner`] drives a mode's step catalog through the
//! provider pool. Provider output goes through the [`condition`] detector,
//! failures through the [`error_handler`], and every state change is
//! checkpointed via `tern-store` so an interrupted run resumes where it
//! stopped.

pub mod clock;
pub mod condition;
pub mod config;
pub mod error;
pub mod error_handler;
pub mod jobs;
pub mod prompt;
pub mod provider;
pub mod runner;
pub mod state;
pub mod steps;

pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::{ConditionDetector, Signal};
pub use config::{HarnessConfig, ProviderConfig, ProviderKind};
pub use error::{HarnessError, Result, TransportError};
pub use error_handler::{Action, Decision, ErrorHandler};
pub use jobs::{JobError, JobManager, JobResult};
pub use runner::{HarnessRunner, RunOutcome, RunRequest, RunSummary, StatusReport};
pub use steps::{Step, StepCatalog};
