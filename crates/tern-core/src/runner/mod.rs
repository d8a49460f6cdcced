//! The harness runner: drives one mode's workflow run to completion, a pause
//! or a failure.
//!
//! One iteration of the loop:
//!
//! 1. resolve the step (in-progress step first, then the next eligible one)
//! 2. select a provider, or pause as `paused_rate_limited`
//! 3. submit the prompt as a job and wait for it
//! 4. classify the output
//! 5. record success and advance, pause for input, or hand the failure to
//!    the error handler and carry out its decision
//!
//! Every transition is written to the checkpoint before the next iteration,
//! so a crash resumes from the last completed step. An interrupt leaves the
//! run `running` and resumable.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tern_store::models::{
    FailureKind, FailureRecord, LogEntry, Mode, PendingInput, Question, WorkflowRun, WorkflowState,
};
use tern_store::{CheckpointLoad, CheckpointStore, JobStore};

use crate::clock::Clock;
use crate::condition::{ConditionDetector, Signal};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, TransportError};
use crate::error_handler::{Action, ErrorContext, ErrorHandler};
use crate::jobs::JobManager;
use crate::prompt::build_prompt;
use crate::provider::{ProviderHealth, ProviderManager, ProviderOutcome, ProviderRegistry};
use crate::state::WorkflowStateMachine;
use crate::steps::{Step, StepCatalog};

/// Answers that approve a gated step.
const APPROVALS: [&str; 4] = ["yes", "y", "approve", "approved"];

/// Called with the step id and elapsed time while a job is running.
pub type LivenessCallback = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// What the caller asked for.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Run this step next instead of the next eligible one.
    pub step: Option<String>,
    /// Ignore unmet dependencies and re-run completed or failed work.
    pub force: bool,
    /// Answers to pending questions, by question number.
    pub answers: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    PausedForUserInput {
        step_id: String,
        questions: Vec<Question>,
    },
    PausedRateLimited {
        resume_after: Option<DateTime<Utc>>,
    },
    PausedError {
        step_id: String,
        message: String,
    },
    Failed(FailureRecord),
    Interrupted {
        step_id: Option<String>,
    },
}

impl RunOutcome {
    /// `1` only for an aborted run; pauses and interrupts are resumable.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Failed(_) => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::PausedForUserInput { step_id, questions } => write!(
                f,
                "paused on {step_id}: waiting for answers to {} question(s)",
                questions.len()
            ),
            Self::PausedRateLimited {
                resume_after: Some(at),
            } => write!(f, "paused: all providers unavailable until {}", at.to_rfc3339()),
            Self::PausedRateLimited { resume_after: None } => {
                f.write_str("paused: no provider is available")
            }
            Self::PausedError { step_id, message } => {
                write!(f, "paused on {step_id} after an internal error: {message}")
            }
            Self::Failed(record) => write!(f, "failed: {record}"),
            Self::Interrupted { step_id: Some(id) } => write!(f, "interrupted during {id}"),
            Self::Interrupted { step_id: None } => f.write_str("interrupted"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Problems the caller should see that did not stop the run.
    pub warnings: Vec<String>,
    pub run: WorkflowRun,
}

/// Snapshot for `status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub run: WorkflowRun,
    pub total_steps: usize,
    pub remaining_steps: usize,
    pub next_step: Option<String>,
    pub warning: Option<String>,
}

/// Per-step attempt bookkeeping; reset whenever the step changes.
#[derive(Debug, Default)]
struct StepAttempts {
    step_id: Option<String>,
    total: u32,
    /// Attempts that ended in a short rate-limit wait.
    rate_limited: u32,
    per_provider: HashMap<String, u32>,
}

impl StepAttempts {
    fn enter(&mut self, step_id: &str) {
        if self.step_id.as_deref() != Some(step_id) {
            *self = Self {
                step_id: Some(step_id.to_string()),
                ..Self::default()
            };
        }
    }

    /// Attempts that count toward `max_attempts_per_step`. Waiting out a
    /// throttle is not a failed try.
    fn counted(&self) -> u32 {
        self.total.saturating_sub(self.rate_limited)
    }

    fn failed_on(&mut self, provider_id: &str) -> u32 {
        let count = self.per_provider.entry(provider_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

pub struct HarnessRunner {
    mode: Mode,
    project_dir: PathBuf,
    config: HarnessConfig,
    catalog: StepCatalog,
    store: CheckpointStore,
    registry: ProviderRegistry,
    providers: ProviderManager,
    jobs: JobManager,
    detector: ConditionDetector,
    handler: ErrorHandler,
    clock: Arc<dyn Clock>,
    liveness: Option<LivenessCallback>,
}

impl HarnessRunner {
    pub fn new(
        mode: Mode,
        project_dir: impl Into<PathBuf>,
        config: HarnessConfig,
        catalog: StepCatalog,
        store: CheckpointStore,
        registry: ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let project_dir = project_dir.into();
        let providers = ProviderManager::new(&config, Arc::clone(&clock));
        let jobs = JobManager::new(&project_dir)
            .with_store(JobStore::new(store.config()))
            .with_liveness_interval(config.harness.liveness_interval());
        let detector = ConditionDetector::new(
            config.detection.clone(),
            config.retry.default_rate_limit_secs,
        );
        let handler = ErrorHandler::new(config.retry.clone());

        Self {
            mode,
            project_dir,
            config,
            catalog,
            store,
            registry,
            providers,
            jobs,
            detector,
            handler,
            clock,
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, callback: LivenessCallback) -> Self {
        self.liveness = Some(callback);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.providers.snapshot()
    }

    // -----------------------------------------------------------------------
    // Status / reset
    // -----------------------------------------------------------------------

    pub fn status(&self) -> StatusReport {
        let (run, warning) = match self.store.load(self.mode) {
            CheckpointLoad::Found(run) => (*run, None),
            CheckpointLoad::Missing => (WorkflowRun::new(self.mode, &self.project_dir), None),
            CheckpointLoad::Corrupt(reason) => (
                WorkflowRun::new(self.mode, &self.project_dir),
                Some(
                    HarnessError::CorruptCheckpoint {
                        mode: self.mode,
                        reason,
                    }
                    .to_string(),
                ),
            ),
        };
        StatusReport {
            total_steps: self.catalog.len(),
            remaining_steps: self.catalog.remaining(&run.completed_steps),
            next_step: run
                .current_step_id
                .clone()
                .or_else(|| self.catalog.next_eligible(&run.completed_steps).map(|s| s.id.clone())),
            run,
            warning,
        }
    }

    /// Discard the checkpoint and execution log; the mode returns to idle.
    pub fn reset(&self) -> Result<(), HarnessError> {
        self.store.reset(self.mode)?;
        info!(mode = %self.mode, "workflow reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Run (or resume) the workflow until it completes, pauses, fails or
    /// `cancel` fires.
    ///
    /// Returns `Err` only for requests that cannot start (unknown step,
    /// unmet dependencies) and for persistence failures.
    pub async fn run(
        &mut self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunSummary, HarnessError> {
        let mut warnings = Vec::new();
        let mut run = match self.store.load(self.mode) {
            CheckpointLoad::Found(run) => *run,
            CheckpointLoad::Missing => WorkflowRun::new(self.mode, &self.project_dir),
            CheckpointLoad::Corrupt(reason) => {
                let error = HarnessError::CorruptCheckpoint {
                    mode: self.mode,
                    reason,
                };
                warn!(mode = %self.mode, %error, "ignoring corrupt checkpoint, starting over");
                warnings.push(format!("{error}; a new run was started"));
                WorkflowRun::new(self.mode, &self.project_dir)
            }
        };

        // Validation happens before anything is mutated.
        if let Some(target) = &request.step {
            let step = self
                .catalog
                .get(target)
                .ok_or_else(|| HarnessError::UnknownStep {
                    mode: self.mode,
                    step_id: target.clone(),
                })?;
            if !request.force {
                let missing = self.catalog.unmet_dependencies(step, &run.completed_steps);
                if !missing.is_empty() {
                    return Err(HarnessError::DependencyUnmet {
                        step_id: target.clone(),
                        missing,
                    });
                }
            }
        }

        if !request.force {
            if let Some(outcome) = self.early_outcome(&run) {
                return Ok(RunSummary {
                    outcome,
                    warnings,
                    run,
                });
            }
        }

        // Pending questions must be resolved before anything runs.
        if let Some(outcome) = self.resolve_pending_input(&mut run, &request, &mut warnings)? {
            return Ok(RunSummary {
                outcome,
                warnings,
                run,
            });
        }

        let resumed_from = run.state;
        WorkflowStateMachine::transition(&mut run, WorkflowState::Running, request.force, self.clock.now())?;
        run.resume_after = None;
        if resumed_from.is_terminal() {
            run.last_failure = None;
        }

        if let Some(target) = &request.step {
            if request.force {
                if run.unmark_completed(target) {
                    info!(step_id = %target, "forcing re-run of completed step");
                }
                run.current_step_id = Some(target.clone());
            } else if run.is_completed(target) {
                warnings.push(format!(
                    "step {target} is already completed; use --force to run it again"
                ));
            } else {
                run.current_step_id = Some(target.clone());
            }
        }

        let verb = if resumed_from == WorkflowState::Idle {
            "started"
        } else {
            "resumed"
        };
        self.log(&mut run, LogEntry::info(format!("{} workflow {verb}", self.mode)));
        self.persist(&run)?;

        let outcome = self.drive(&mut run, &cancel).await?;
        Ok(RunSummary {
            outcome,
            warnings,
            run,
        })
    }

    /// Outcomes that need no work unless the caller forces.
    fn early_outcome(&self, run: &WorkflowRun) -> Option<RunOutcome> {
        match run.state {
            WorkflowState::Completed => Some(RunOutcome::Completed),
            WorkflowState::Failed => run.last_failure.clone().map(RunOutcome::Failed),
            WorkflowState::PausedRateLimited => {
                let at = run.resume_after?;
                (at > self.clock.now()).then_some(RunOutcome::PausedRateLimited {
                    resume_after: Some(at),
                })
            }
            _ => None,
        }
    }

    /// Merge supplied answers into the run. Returns an outcome when the run
    /// must stay paused.
    fn resolve_pending_input(
        &self,
        run: &mut WorkflowRun,
        request: &RunRequest,
        warnings: &mut Vec<String>,
    ) -> Result<Option<RunOutcome>, HarnessError> {
        let Some(pending) = run.pending_input.clone() else {
            if !request.answers.is_empty() {
                match &request.step {
                    Some(target) => {
                        run.user_answers
                            .entry(target.clone())
                            .or_default()
                            .extend(request.answers.clone());
                    }
                    None => warnings
                        .push("answers were ignored: no questions are pending".to_string()),
                }
            }
            return Ok(None);
        };

        if request.force && request.step.as_deref().is_some_and(|s| s != pending.step_id) {
            warnings.push(format!(
                "discarding unanswered questions for step {}",
                pending.step_id
            ));
            run.pending_input = None;
            return Ok(None);
        }

        if pending.gate_approval {
            let answer = request.answers.get(&1).map(|a| a.trim()).unwrap_or("");
            if answer.is_empty() {
                return Ok(Some(still_waiting(&pending)));
            }
            run.pending_input = None;
            if APPROVALS.contains(&answer.to_lowercase().as_str()) {
                run.mark_completed(&pending.step_id);
                self.log(run, LogEntry::info(format!("step {} approved", pending.step_id)));
            } else {
                run.review_notes
                    .entry(pending.step_id.clone())
                    .or_default()
                    .push(answer.to_string());
                run.current_step_id = Some(pending.step_id.clone());
                self.log(
                    run,
                    LogEntry::info(format!("step {} sent back for revision", pending.step_id)),
                );
            }
            return Ok(None);
        }

        let answers = run.user_answers.entry(pending.step_id.clone()).or_default();
        for (number, text) in &request.answers {
            if !text.trim().is_empty() {
                answers.insert(*number, text.clone());
            }
        }
        let unanswered = pending.unanswered_required(answers);
        if !unanswered.is_empty() {
            let list: Vec<String> = unanswered.iter().map(u32::to_string).collect();
            warnings.push(format!(
                "required question(s) {} are still unanswered",
                list.join(", ")
            ));
            // Keep what was answered so far.
            self.persist(run)?;
            return Ok(Some(still_waiting(&pending)));
        }

        run.pending_input = None;
        run.current_step_id = Some(pending.step_id.clone());
        self.log(
            run,
            LogEntry::info(format!("answers received for step {}", pending.step_id)),
        );
        Ok(None)
    }

    /// The step loop. `run` is `running` on entry.
    async fn drive(
        &mut self,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, HarnessError> {
        let mut attempts = StepAttempts::default();
        let mut preferred: Option<String> = run.current_provider_id.clone();

        loop {
            if cancel.is_cancelled() {
                return self.interrupted(run);
            }

            // 1. Resolve the step.
            let step = match self.resolve_step(run) {
                Some(step) => step,
                None => return self.complete(run),
            };
            attempts.enter(&step.id);
            run.current_step_id = Some(step.id.clone());

            // 2. Select a provider.
            let provider_id = match self.providers.select_provider(preferred.as_deref()) {
                Ok(id) => id,
                Err(HarnessError::NoProviderAvailable { resume_after }) => {
                    return self.pause_rate_limited(run, &step.id, resume_after);
                }
                Err(e) => return Err(e),
            };
            let provider = self
                .registry
                .get(&provider_id)
                .ok_or_else(|| HarnessError::UnknownProvider(provider_id.clone()))?;
            if run.current_provider_id.as_deref() != Some(provider_id.as_str()) {
                info!(step_id = %step.id, provider = %provider_id, "using provider");
            }
            run.current_provider_id = Some(provider_id.clone());

            attempts.total += 1;
            run.metrics.total_attempts += 1;
            self.log(
                run,
                LogEntry::info(format!(
                    "step {} attempt {} via {provider_id}",
                    step.id, attempts.total
                )),
            );
            self.persist(run)?;

            // 3. Submit and wait.
            let prompt = build_prompt(&step, run);
            let job_id = match self.jobs.submit(&step.id, provider, prompt).await {
                Ok(id) => id,
                Err(e) => return self.pause_error(run, &step.id, format!("could not start job: {e}")),
            };
            let liveness = self.liveness.clone();
            let step_id = step.id.clone();
            let awaited = self
                .jobs
                .await_job(
                    job_id,
                    self.config.harness.step_timeout(),
                    cancel,
                    |elapsed| {
                        info!(step_id = %step_id, elapsed_secs = elapsed.as_secs(), "step still running");
                        if let Some(callback) = &liveness {
                            callback(&step_id, elapsed);
                        }
                    },
                )
                .await;
            let result = match awaited {
                Ok(result) => result,
                Err(e) => return self.pause_error(run, &step.id, format!("lost track of job: {e}")),
            };

            if cancel.is_cancelled() {
                return self.interrupted(run);
            }

            // 4. Classify.
            let remaining_after = self
                .catalog
                .remaining(&run.completed_steps)
                .saturating_sub(1);
            let mut permanent = false;
            let signal = match (&result.output, &result.error) {
                (Some(output), _) => {
                    self.detector
                        .classify(&output.output, Some(output.exit_status), remaining_after)
                }
                (None, Some(TransportError::WorkerCrashed(message))) => {
                    return self.pause_error(run, &step.id, format!("job worker crashed: {message}"));
                }
                (None, Some(error)) => {
                    permanent = error.is_permanent();
                    self.detector.classify_transport(error)
                }
                (None, None) => Signal::GenericError {
                    message: "job finished without output".to_string(),
                },
            };
            debug!(step_id = %step.id, provider = %provider_id, signal = %signal, "classified output");

            // 5. Act on the signal.
            match signal {
                Signal::Ok | Signal::WorkComplete => {
                    self.providers.record_success(&provider_id);
                    let output = result.output.map(|o| o.output).unwrap_or_default();
                    match self.store.write_step_output(self.mode, &step.id, &output) {
                        Ok(path) => debug!(step_id = %step.id, path = %path.display(), "step output saved"),
                        Err(e) => warn!(step_id = %step.id, error = %e, "failed to save step output"),
                    }
                    preferred = Some(provider_id.clone());

                    if step.requires_gate_approval {
                        return self.pause_for_approval(run, &step);
                    }

                    run.mark_completed(&step.id);
                    run.last_failure = None;
                    info!(step_id = %step.id, provider = %provider_id, "step completed");
                    self.log(run, LogEntry::info(format!("step {} completed", step.id)));
                    if signal == Signal::WorkComplete {
                        return self.complete(run);
                    }
                    self.persist(run)?;
                }

                Signal::NeedsUserFeedback { questions } => {
                    self.providers.record_success(&provider_id);
                    return self.pause_for_questions(run, &step.id, questions);
                }

                Signal::RateLimited { retry_after_secs } => {
                    self.providers.record_failure(
                        &provider_id,
                        ProviderOutcome::RateLimited {
                            retry_after: Duration::from_secs(retry_after_secs),
                        },
                    );
                    attempts.rate_limited += 1;
                    let failures = attempts.failed_on(&provider_id);
                    let error = HarnessError::RateLimited {
                        provider_id: provider_id.clone(),
                        retry_after_secs,
                    };
                    self.note_failure(run, &error, &provider_id, &step.id, attempts.total);
                    let signal = Signal::RateLimited { retry_after_secs };
                    if let Some(outcome) = self
                        .follow_decision(run, &signal, &provider_id, &step.id, failures, &attempts, &mut preferred, cancel)
                        .await?
                    {
                        return Ok(outcome);
                    }
                }

                Signal::GenericError { message } => {
                    let outcome = if permanent {
                        ProviderOutcome::Fatal
                    } else {
                        ProviderOutcome::Error
                    };
                    self.providers.record_failure(&provider_id, outcome);
                    let mut failures = attempts.failed_on(&provider_id);
                    if permanent {
                        failures = failures.max(self.providers.max_retries(&provider_id));
                    }
                    let error = match &result.error {
                        Some(transport) if result.output.is_none() => {
                            HarnessError::Transport(transport.clone())
                        }
                        _ => HarnessError::ProviderOutput {
                            provider_id: provider_id.clone(),
                            message: message.clone(),
                        },
                    };
                    warn!(step_id = %step.id, provider = %provider_id, attempt = failures, %error, "step attempt failed");
                    self.note_failure(run, &error, &provider_id, &step.id, attempts.total);
                    let signal = Signal::GenericError { message };
                    if let Some(outcome) = self
                        .follow_decision(run, &signal, &provider_id, &step.id, failures, &attempts, &mut preferred, cancel)
                        .await?
                    {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// In-progress step first, then the next eligible catalog step.
    fn resolve_step(&self, run: &WorkflowRun) -> Option<Step> {
        let current = run
            .current_step_id
            .as_deref()
            .filter(|id| !run.is_completed(id))
            .and_then(|id| self.catalog.get(id));
        current
            .or_else(|| self.catalog.next_eligible(&run.completed_steps))
            .cloned()
    }

    /// Ask the error handler what to do about a failed attempt and do it.
    /// Returns an outcome when the run stops.
    #[allow(clippy::too_many_arguments)]
    async fn follow_decision(
        &mut self,
        run: &mut WorkflowRun,
        signal: &Signal,
        provider_id: &str,
        step_id: &str,
        failures: u32,
        attempts: &StepAttempts,
        preferred: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<RunOutcome>, HarnessError> {
        let chain = self.providers.fallback_chain(provider_id);
        let consecutive_failures = self
            .providers
            .health(provider_id)
            .map_or(failures, |h| h.consecutive_failures);
        let ctx = ErrorContext {
            provider_id,
            step_id,
            attempt: failures,
            consecutive_failures,
            max_retries: self.providers.max_retries(provider_id),
            fallback_chain: &chain,
            recovers_at: self.providers.soonest_recovery(),
        };
        let decision = self.handler.decide(signal, &ctx);
        info!(
            step_id,
            provider = provider_id,
            action = %decision.action,
            reason = %decision.reason,
            "error handler decision"
        );

        let retrying = matches!(
            decision.action,
            Action::RetrySameProvider | Action::SwitchProvider
        );
        let max_attempts = self.config.harness.max_attempts_per_step;
        if retrying && attempts.counted() >= max_attempts {
            let message = format!(
                "gave up after {} attempts (limit {max_attempts}): {}",
                attempts.counted(),
                decision.reason
            );
            return self.fail(run, step_id, provider_id, message, attempts.total).map(Some);
        }

        match decision.action {
            Action::Proceed | Action::PauseForUserInput => Ok(None),
            Action::RetrySameProvider | Action::WaitAndRetrySameProvider => {
                let backoff = decision.backoff.unwrap_or_default();
                if decision.action == Action::WaitAndRetrySameProvider {
                    run.metrics.rate_limit_waits += 1;
                } else {
                    run.metrics.retries += 1;
                }
                self.log(
                    run,
                    LogEntry::warn(format!(
                        "{}; retrying {provider_id} in {}s",
                        decision.reason,
                        backoff.as_secs()
                    )),
                );
                self.persist(run)?;
                *preferred = Some(provider_id.to_string());
                if !self.sleep(backoff, cancel).await {
                    return self.interrupted(run).map(Some);
                }
                Ok(None)
            }
            Action::SwitchProvider => {
                run.metrics.provider_switches += 1;
                let target = decision.next_provider_id.clone();
                self.log(
                    run,
                    LogEntry::warn(format!(
                        "{}; switching from {provider_id} to {}",
                        decision.reason,
                        target.as_deref().unwrap_or("any available provider")
                    )),
                );
                self.persist(run)?;
                *preferred = target;
                Ok(None)
            }
            Action::AbortStep => self
                .fail(run, step_id, provider_id, decision.reason, attempts.total)
                .map(Some),
        }
    }

    /// Backoff that ends early on cancellation. Returns `false` if cancelled.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if duration.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.clock.sleep(duration) => true,
            _ = cancel.cancelled() => false,
        }
    }

    // -----------------------------------------------------------------------
    // Terminal and paused transitions
    // -----------------------------------------------------------------------

    fn complete(&self, run: &mut WorkflowRun) -> Result<RunOutcome, HarnessError> {
        WorkflowStateMachine::transition(run, WorkflowState::Completed, false, self.clock.now())?;
        run.current_step_id = None;
        run.pending_input = None;
        info!(mode = %self.mode, steps = run.completed_steps.len(), "workflow completed");
        self.log(run, LogEntry::info(format!("{} workflow completed", self.mode)));
        self.persist(run)?;
        Ok(RunOutcome::Completed)
    }

    fn fail(
        &self,
        run: &mut WorkflowRun,
        step_id: &str,
        provider_id: &str,
        message: String,
        attempts: u32,
    ) -> Result<RunOutcome, HarnessError> {
        let kind = run
            .last_failure
            .as_ref()
            .map_or(FailureKind::ProviderOutput, |f| f.kind);
        let record = FailureRecord {
            kind,
            message,
            provider_id: Some(provider_id.to_string()),
            step_id: Some(step_id.to_string()),
            attempts,
            at: self.clock.now(),
        };
        WorkflowStateMachine::transition(run, WorkflowState::Failed, false, self.clock.now())?;
        run.last_failure = Some(record.clone());
        error!(step_id, provider = provider_id, attempts, "step aborted");
        self.log(run, LogEntry::error(format!("aborted: {record}")));
        self.persist(run)?;
        Ok(RunOutcome::Failed(record))
    }

    fn interrupted(&self, run: &mut WorkflowRun) -> Result<RunOutcome, HarnessError> {
        info!(step_id = ?run.current_step_id, "run interrupted, state kept for resume");
        self.log(run, LogEntry::warn("interrupted; run again to resume"));
        run.updated_at = self.clock.now();
        self.persist(run)?;
        Ok(RunOutcome::Interrupted {
            step_id: run.current_step_id.clone(),
        })
    }

    fn pause_rate_limited(
        &self,
        run: &mut WorkflowRun,
        step_id: &str,
        resume_after: Option<DateTime<Utc>>,
    ) -> Result<RunOutcome, HarnessError> {
        WorkflowStateMachine::transition(run, WorkflowState::PausedRateLimited, false, self.clock.now())?;
        run.resume_after = resume_after;
        let when = resume_after.map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339());
        warn!(step_id, resume_after = %when, "no provider available, pausing");
        self.log(
            run,
            LogEntry::warn(format!("no provider available for {step_id}; resume after {when}")),
        );
        self.persist(run)?;
        Ok(RunOutcome::PausedRateLimited { resume_after })
    }

    fn pause_error(
        &self,
        run: &mut WorkflowRun,
        step_id: &str,
        message: String,
    ) -> Result<RunOutcome, HarnessError> {
        WorkflowStateMachine::transition(run, WorkflowState::PausedError, false, self.clock.now())?;
        run.last_failure = Some(FailureRecord {
            kind: FailureKind::Internal,
            message: message.clone(),
            provider_id: run.current_provider_id.clone(),
            step_id: Some(step_id.to_string()),
            attempts: 0,
            at: self.clock.now(),
        });
        error!(step_id, error = %message, "pausing after internal error");
        self.log(run, LogEntry::error(message.clone()));
        self.persist(run)?;
        Ok(RunOutcome::PausedError {
            step_id: step_id.to_string(),
            message,
        })
    }

    fn pause_for_questions(
        &self,
        run: &mut WorkflowRun,
        step_id: &str,
        questions: Vec<Question>,
    ) -> Result<RunOutcome, HarnessError> {
        WorkflowStateMachine::transition(run, WorkflowState::PausedUserFeedback, false, self.clock.now())?;
        run.pending_input = Some(PendingInput {
            step_id: step_id.to_string(),
            gate_approval: false,
            questions: questions.clone(),
        });
        info!(step_id, questions = questions.len(), "provider needs user input");
        self.log(
            run,
            LogEntry::info(format!("step {step_id} is waiting for {} answer(s)", questions.len())),
        );
        self.persist(run)?;
        Ok(RunOutcome::PausedForUserInput {
            step_id: step_id.to_string(),
            questions,
        })
    }

    fn pause_for_approval(&self, run: &mut WorkflowRun, step: &Step) -> Result<RunOutcome, HarnessError> {
        let questions = vec![Question {
            number: 1,
            text: format!(
                "Approve the output of step {}? Answer yes to continue, or describe what to change.",
                step.id
            ),
            required: true,
        }];
        WorkflowStateMachine::transition(run, WorkflowState::PausedUserFeedback, false, self.clock.now())?;
        run.pending_input = Some(PendingInput {
            step_id: step.id.clone(),
            gate_approval: true,
            questions: questions.clone(),
        });
        info!(step_id = %step.id, "step output awaiting approval");
        self.log(run, LogEntry::info(format!("step {} awaiting approval", step.id)));
        self.persist(run)?;
        Ok(RunOutcome::PausedForUserInput {
            step_id: step.id.clone(),
            questions,
        })
    }

    // -----------------------------------------------------------------------
    // Persistence helpers
    // -----------------------------------------------------------------------

    fn note_failure(
        &self,
        run: &mut WorkflowRun,
        error: &HarnessError,
        provider_id: &str,
        step_id: &str,
        attempts: u32,
    ) {
        run.last_failure = Some(FailureRecord {
            kind: error.failure_kind(),
            message: error.to_string(),
            provider_id: Some(provider_id.to_string()),
            step_id: Some(step_id.to_string()),
            attempts,
            at: self.clock.now(),
        });
    }

    fn persist(&self, run: &WorkflowRun) -> Result<(), HarnessError> {
        self.store.save(run)?;
        Ok(())
    }

    /// The execution log is informational; failing to append never stops
    /// the run.
    fn log(&self, run: &mut WorkflowRun, entry: LogEntry) {
        if let Err(e) = self.store.append_log(run, entry) {
            warn!(error = %e, "failed to append execution log");
        }
    }
}

fn still_waiting(pending: &PendingInput) -> RunOutcome {
    RunOutcome::PausedForUserInput {
        step_id: pending.step_id.clone(),
        questions: pending.questions.clone(),
    }
}

impl fmt::Debug for HarnessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessRunner")
            .field("mode", &self.mode)
            .field("project_dir", &self.project_dir)
            .field("providers", &self.providers)
            .finish()
    }
}
