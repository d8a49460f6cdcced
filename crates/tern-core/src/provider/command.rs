//! Subprocess-backed provider.
//!
//! Runs the configured command in the project directory and collects its
//! stdout line by line. Depending on [`ProviderKind`] the prompt goes to
//! stdin or is appended as the final argument.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::trait_def::Provider;
use super::types::{InvocationRequest, ProviderOutput};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::TransportError;

/// Time a provider gets to exit after SIGTERM before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CommandProvider {
    id: String,
    kind: ProviderKind,
    command: String,
    args: Vec<String>,
    model_flag: Option<String>,
    model: Option<String>,
    env: BTreeMap<String, String>,
}

impl CommandProvider {
    pub fn new(id: impl Into<String>, kind: ProviderKind, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            command: command.into(),
            args: Vec::new(),
            model_flag: None,
            model: None,
            env: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            kind: config.kind,
            command: config.command.clone(),
            args: config.args.clone(),
            model_flag: config.model_flag.clone(),
            model: config.model_ids.first().cloned(),
            env: config.env.clone(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Full argument list for one invocation.
    fn arguments(&self, prompt: &str) -> Vec<String> {
        let mut args = self.args.clone();
        if let (Some(flag), Some(model)) = (&self.model_flag, &self.model) {
            args.push(flag.clone());
            args.push(model.clone());
        }
        if !self.kind.prompt_on_stdin() {
            args.push(prompt.to_string());
        }
        args
    }
}

// ---------------------------------------------------------------------------
// Process helpers
// ---------------------------------------------------------------------------

fn stdout_lines(stdout: ChildStdout) -> impl Stream<Item = std::io::Result<String>> {
    async_stream::stream! {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => yield Ok(line),
                Ok(None) => break,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    }
}

/// SIGTERM, wait up to [`TERM_GRACE`], then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and have not reaped.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(Ok(_)) => debug!("provider process exited after SIGTERM"),
        _ => {
            debug!("provider process did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Provider trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Provider for CommandProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<ProviderOutput, TransportError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(self.arguments(&request.prompt))
            .current_dir(&request.working_dir)
            .envs(&self.env)
            .stdin(if self.kind.prompt_on_stdin() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| TransportError::Spawn {
            command: self.command.clone(),
            message: e.to_string(),
        })?;
        debug!(provider = %self.id, pid = ?child.id(), "provider process spawned");

        if let Some(mut stdin) = child.stdin.take() {
            // Written from a separate task so a large prompt cannot block
            // against a full stdout pipe.
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %e, "provider closed stdin early");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("provider stdout was not captured".to_string()))?;
        let mut lines = Box::pin(stdout_lines(stdout));

        let mut output = String::new();
        loop {
            tokio::select! {
                _ = request.cancel.cancelled() => {
                    terminate(&mut child).await;
                    return Err(TransportError::Cancelled);
                }
                next = lines.next() => match next {
                    Some(Ok(line)) => {
                        request.emit(&line);
                        output.push_str(&line);
                        output.push('\n');
                    }
                    Some(Err(e)) => {
                        terminate(&mut child).await;
                        return Err(TransportError::Io(format!("reading provider output: {e}")));
                    }
                    None => break,
                }
            }
        }

        let status = tokio::select! {
            _ = request.cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(TransportError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| TransportError::Io(format!("waiting for provider: {e}")))?,
        };

        // Providers often report throttling on stderr, so it is kept for
        // classification.
        if let Some(task) = stderr_task {
            let stderr = task.await.unwrap_or_default();
            if !stderr.trim().is_empty() {
                for line in stderr.lines() {
                    request.emit(line);
                }
                output.push_str(&stderr);
            }
        }

        let exit_status = status.code().unwrap_or(-1);
        debug!(provider = %self.id, exit_status, "provider process finished");
        Ok(ProviderOutput {
            output,
            exit_status,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
