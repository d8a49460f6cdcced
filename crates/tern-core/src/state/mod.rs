//! Workflow run state transitions.

use chrono::{DateTime, Utc};
use tracing::debug;

use tern_store::models::{WorkflowRun, WorkflowState};

use crate::error::HarnessError;

/// The workflow state machine.
///
/// ```text
/// idle                  -> running
/// running               -> paused_user_feedback | paused_rate_limited | paused_error
/// running               -> completed | failed
/// paused_*              -> running
/// completed | failed    -> running   (forced re-run only)
/// any                   -> idle      (reset)
/// ```
pub struct WorkflowStateMachine;

impl WorkflowStateMachine {
    pub fn is_valid_transition(from: WorkflowState, to: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (from, to),
            (Idle, Running)
                | (Running, PausedUserFeedback)
                | (Running, PausedRateLimited)
                | (Running, PausedError)
                | (Running, Completed)
                | (Running, Failed)
                | (PausedUserFeedback, Running)
                | (PausedRateLimited, Running)
                | (PausedError, Running)
                | (_, Idle)
        )
    }

    /// Edges that need an explicit force from the caller.
    pub fn is_forced_transition(from: WorkflowState, to: WorkflowState) -> bool {
        matches!(
            (from, to),
            (WorkflowState::Completed, WorkflowState::Running)
                | (WorkflowState::Failed, WorkflowState::Running)
        )
    }

    /// Move `run` to `to`, stamping `updated_at`. Staying in the same state
    /// is allowed and only refreshes the timestamp.
    pub fn transition(
        run: &mut WorkflowRun,
        to: WorkflowState,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<(), HarnessError> {
        let from = run.state;
        let allowed = from == to
            || Self::is_valid_transition(from, to)
            || (force && Self::is_forced_transition(from, to));
        if !allowed {
            return Err(HarnessError::InvalidTransition { from, to });
        }
        if from != to {
            debug!(mode = %run.mode, %from, %to, "workflow transition");
        }
        run.state = to;
        run.updated_at = now;
        Ok(())
    }
}
