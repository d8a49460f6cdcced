//! Retry / switch / abort policy.
//!
//! | Signal                 | Condition                         | Action                        |
//! |------------------------|-----------------------------------|-------------------------------|
//! | `rate_limited`         | wait <= ceiling                   | wait, retry same provider     |
//! | `rate_limited`         | wait > ceiling                    | switch provider               |
//! | `generic_error`        | failures < max_retries            | retry same provider (backoff) |
//! | `generic_error`        | failures >= max, fallback exists  | switch provider               |
//! | `generic_error`        | failures >= max, some recover     | switch provider (pauses)      |
//! | `generic_error`        | failures >= max, none recover     | abort step                    |
//! | `needs_user_feedback`  |                                   | pause for user input          |
//! | `ok` / `work_complete` |                                   | proceed                       |
//!
//! "Some recover" means no alternative is available right now but a blocked
//! provider comes back on its own at [`ErrorContext::recovers_at`]. The
//! switch then finds nothing to select and the run pauses as
//! `paused_rate_limited` until that time.
//!
//! [`ErrorHandler::decide`] is pure: it reads the context it is given and
//! returns a [`Decision`]. The runner carries the decision out.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tern_store::models::Question;

use crate::condition::Signal;
use crate::config::RetrySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Proceed,
    RetrySameProvider,
    WaitAndRetrySameProvider,
    SwitchProvider,
    PauseForUserInput,
    AbortStep,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Proceed => "proceed",
            Self::RetrySameProvider => "retry_same_provider",
            Self::WaitAndRetrySameProvider => "wait_and_retry_same_provider",
            Self::SwitchProvider => "switch_provider",
            Self::PauseForUserInput => "pause_for_user_input",
            Self::AbortStep => "abort_step",
        };
        f.write_str(s)
    }
}

/// What the handler knows about the failing attempt.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub provider_id: &'a str,
    pub step_id: &'a str,
    /// Failed attempts of this step on this provider, including this one.
    pub attempt: u32,
    /// The provider's consecutive failures, as tracked by the provider
    /// manager after recording this one.
    pub consecutive_failures: u32,
    pub max_retries: u32,
    /// Available alternatives, in priority order.
    pub fallback_chain: &'a [String],
    /// Soonest time a blocked provider (this one included) recovers.
    pub recovers_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub next_provider_id: Option<String>,
    pub backoff: Option<Duration>,
    pub questions: Vec<Question>,
    pub reason: String,
}

impl Decision {
    fn new(action: Action, reason: impl Into<String>) -> Self {
        Self {
            action,
            next_provider_id: None,
            backoff: None,
            questions: Vec::new(),
            reason: reason.into(),
        }
    }

    fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    fn with_next(mut self, next: Option<&String>) -> Self {
        self.next_provider_id = next.cloned();
        self
    }
}

#[derive(Debug, Clone)]
pub struct ErrorHandler {
    policy: RetrySettings,
}

impl ErrorHandler {
    pub fn new(policy: RetrySettings) -> Self {
        Self { policy }
    }

    /// Exponential backoff before retry number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_backoff_secs`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let secs = self
            .policy
            .base_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.policy.max_backoff_secs);
        Duration::from_secs(secs)
    }

    pub fn decide(&self, signal: &Signal, ctx: &ErrorContext<'_>) -> Decision {
        match signal {
            Signal::Ok | Signal::WorkComplete => Decision::new(Action::Proceed, signal.name()),

            Signal::NeedsUserFeedback { questions } => {
                let mut decision = Decision::new(
                    Action::PauseForUserInput,
                    format!("provider asked {} question(s)", questions.len()),
                );
                decision.questions = questions.clone();
                decision
            }

            Signal::RateLimited { retry_after_secs } => {
                if *retry_after_secs <= self.policy.rate_limit_ceiling_secs {
                    Decision::new(
                        Action::WaitAndRetrySameProvider,
                        format!("{} rate limited for {retry_after_secs}s", ctx.provider_id),
                    )
                    .with_backoff(Duration::from_secs(*retry_after_secs))
                } else {
                    Decision::new(
                        Action::SwitchProvider,
                        format!(
                            "{} rate limited for {retry_after_secs}s, over the {}s ceiling",
                            ctx.provider_id, self.policy.rate_limit_ceiling_secs
                        ),
                    )
                    .with_next(ctx.fallback_chain.first())
                }
            }

            Signal::GenericError { message } => {
                let failures = ctx.attempt.max(ctx.consecutive_failures);
                if failures < ctx.max_retries {
                    Decision::new(
                        Action::RetrySameProvider,
                        format!(
                            "attempt {failures}/{} on {} failed: {message}",
                            ctx.max_retries, ctx.provider_id
                        ),
                    )
                    .with_backoff(self.backoff_for(ctx.attempt.max(1)))
                } else if let Some(next) = ctx.fallback_chain.first() {
                    Decision::new(
                        Action::SwitchProvider,
                        format!(
                            "{} exhausted {} retries on {}: {message}",
                            ctx.provider_id, ctx.max_retries, ctx.step_id
                        ),
                    )
                    .with_next(Some(next))
                } else if let Some(at) = ctx.recovers_at {
                    Decision::new(
                        Action::SwitchProvider,
                        format!(
                            "{} exhausted {} retries on {} and every provider is blocked until {}: {message}",
                            ctx.provider_id,
                            ctx.max_retries,
                            ctx.step_id,
                            at.to_rfc3339()
                        ),
                    )
                } else {
                    Decision::new(
                        Action::AbortStep,
                        format!(
                            "{} exhausted {} retries on {} and no provider can recover: {message}",
                            ctx.provider_id, ctx.max_retries, ctx.step_id
                        ),
                    )
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
