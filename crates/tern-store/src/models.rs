use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Workflow category. Each mode has its own step catalog and checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Analyze,
    Execute,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Analyze, Mode::Execute];
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Analyze => "analyze",
            Self::Execute => "execute",
        };
        f.write_str(s)
    }
}

impl FromStr for Mode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyze" => Ok(Self::Analyze),
            "execute" => Ok(Self::Execute),
            other => Err(ModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Mode`] string.
#[derive(Debug, Clone)]
pub struct ModeParseError(pub String);

impl fmt::Display for ModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid mode: {:?} (expected analyze or execute)", self.0)
    }
}

impl std::error::Error for ModeParseError {}

// ---------------------------------------------------------------------------

/// State of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Running,
    PausedUserFeedback,
    PausedRateLimited,
    PausedError,
    Completed,
    Failed,
}

impl WorkflowState {
    /// Returns `true` for any of the three paused states.
    pub fn is_paused(self) -> bool {
        matches!(
            self,
            Self::PausedUserFeedback | Self::PausedRateLimited | Self::PausedError
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::PausedUserFeedback => "paused_user_feedback",
            Self::PausedRateLimited => "paused_rate_limited",
            Self::PausedError => "paused_error",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowState {
    type Err = WorkflowStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused_user_feedback" => Ok(Self::PausedUserFeedback),
            "paused_rate_limited" => Ok(Self::PausedRateLimited),
            "paused_error" => Ok(Self::PausedError),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(WorkflowStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowState`] string.
#[derive(Debug, Clone)]
pub struct WorkflowStateParseError(pub String);

impl fmt::Display for WorkflowStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow state: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowStateParseError {}

// ---------------------------------------------------------------------------

/// Status of one asynchronous provider invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    /// A finished job never changes status again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Class of the last failure recorded on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    RateLimited,
    ProviderOutput,
    NoProviderAvailable,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport_error",
            Self::RateLimited => "rate_limited",
            Self::ProviderOutput => "provider_output_error",
            Self::NoProviderAvailable => "no_provider_available",
            Self::Internal => "internal_error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One line of a run's execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

/// A question a provider asked the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub number: u32,
    pub text: String,
    pub required: bool,
}

/// Questions that must be answered before the run can continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInput {
    pub step_id: String,
    /// `true` when the question is a gate approval rather than provider output.
    #[serde(default)]
    pub gate_approval: bool,
    pub questions: Vec<Question>,
}

impl PendingInput {
    /// Numbers of required questions that have no entry in `answers`.
    pub fn unanswered_required(&self, answers: &BTreeMap<u32, String>) -> Vec<u32> {
        self.questions
            .iter()
            .filter(|q| q.required)
            .filter(|q| answers.get(&q.number).is_none_or(|a| a.trim().is_empty()))
            .map(|q| q.number)
            .collect()
    }
}

/// The last classified failure, kept so an abort can be explained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    pub provider_id: Option<String>,
    pub step_id: Option<String>,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on step {} via provider {} after {} attempt(s): {}",
            self.kind,
            self.step_id.as_deref().unwrap_or("-"),
            self.provider_id.as_deref().unwrap_or("-"),
            self.attempts,
            self.message
        )
    }
}

/// Counters persisted alongside the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub steps_completed: u32,
    pub total_attempts: u32,
    pub retries: u32,
    pub provider_switches: u32,
    pub rate_limit_waits: u32,
}

/// One execution of a mode for a project directory.
///
/// The execution log is not part of the checkpoint document; it lives in
/// its own append-only journal and is re-attached on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub mode: Mode,
    pub project_dir: PathBuf,
    pub state: WorkflowState,
    pub current_step_id: Option<String>,
    pub current_provider_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Insertion-ordered; a step id appears at most once.
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub pending_input: Option<PendingInput>,
    /// Accumulated answers, keyed by step id then question number.
    #[serde(default)]
    pub user_answers: BTreeMap<String, BTreeMap<u32, String>>,
    /// Feedback given when rejecting a gated step's output, oldest first.
    #[serde(default)]
    pub review_notes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub last_failure: Option<FailureRecord>,
    /// Soonest time a provider is expected back when paused rate limited.
    #[serde(default)]
    pub resume_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: RunMetrics,
    #[serde(skip)]
    pub execution_log: Vec<LogEntry>,
}

impl WorkflowRun {
    pub fn new(mode: Mode, project_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            mode,
            project_dir: project_dir.into(),
            state: WorkflowState::Idle,
            current_step_id: None,
            current_provider_id: None,
            started_at: now,
            updated_at: now,
            completed_steps: Vec::new(),
            pending_input: None,
            user_answers: BTreeMap::new(),
            review_notes: BTreeMap::new(),
            last_failure: None,
            resume_after: None,
            metrics: RunMetrics::default(),
            execution_log: Vec::new(),
        }
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
    }

    /// Record a step as completed. Clears `current_step_id` if it pointed at
    /// this step. Returns `false` if the step was already completed.
    pub fn mark_completed(&mut self, step_id: &str) -> bool {
        if self.current_step_id.as_deref() == Some(step_id) {
            self.current_step_id = None;
        }
        if self.is_completed(step_id) {
            return false;
        }
        self.completed_steps.push(step_id.to_string());
        self.metrics.steps_completed += 1;
        true
    }

    /// Remove a step from the completed set (forced re-run).
    pub fn unmark_completed(&mut self, step_id: &str) -> bool {
        let before = self.completed_steps.len();
        self.completed_steps.retain(|s| s != step_id);
        before != self.completed_steps.len()
    }

    /// Answers recorded for a step, in question order.
    pub fn answers_for(&self, step_id: &str) -> Option<&BTreeMap<u32, String>> {
        self.user_answers.get(step_id)
    }
}

// ---------------------------------------------------------------------------

/// One asynchronous provider invocation, as retained for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub step_id: String,
    pub provider_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub exit_status: Option<i32>,
    pub error: Option<String>,
    /// PID of the harness process that owns the worker.
    pub owner_pid: u32,
}

impl JobRecord {
    pub fn new(step_id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: step_id.into(),
            provider_id: provider_id.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            exit_status: None,
            error: None,
            owner_pid: std::process::id(),
        }
    }

    /// Wall time between start and finish, if both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
