//! Types crossing the provider invocation boundary.

use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Everything a provider needs for one invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    /// Directory the provider works in (the project directory).
    pub working_dir: PathBuf,
    /// Cancelled when the job times out or the user interrupts.
    pub cancel: CancellationToken,
    /// Receives output lines as they are produced, if set.
    pub output: Option<UnboundedSender<String>>,
}

impl InvocationRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            cancel: CancellationToken::new(),
            output: None,
        }
    }

    /// Forward one output line to the listener, if any. A dropped receiver
    /// is ignored.
    pub fn emit(&self, line: &str) {
        if let Some(tx) = &self.output {
            let _ = tx.send(line.to_string());
        }
    }
}

/// A completed provider call. A non-zero exit is still an `Ok` at this
/// boundary; classifying it is the condition detector's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutput {
    pub output: String,
    pub exit_status: i32,
}

impl ProviderOutput {
    pub fn new(output: impl Into<String>, exit_status: i32) -> Self {
        Self {
            output: output.into(),
            exit_status,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}
