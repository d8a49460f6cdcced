//! Shared test utilities for tern integration tests.
//!
//! - [`ScriptedProvider`]: a provider that replays queued replies and
//!   records every prompt it receives.
//! - [`TestProject`]: a temporary project directory with its own state
//!   directory, plus helpers that build a runner on a [`ManualClock`] so
//!   rate-limit waits and backoff complete instantly.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tern_core::config::{HarnessConfig, ProviderConfig, ProviderKind};
use tern_core::provider::{InvocationRequest, Provider, ProviderOutput, ProviderRegistry};
use tern_core::steps::{Step, StepCatalog};
use tern_core::{HarnessRunner, ManualClock, TransportError};
use tern_store::models::Mode;
use tern_store::{CheckpointStore, StoreConfig};

// ===========================================================================
// Scripted provider
// ===========================================================================

/// One canned response.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Exit 0 with this output.
    Ok(String),
    /// Exit with `code` and this output.
    Exit(i32, String),
    /// The call itself fails.
    Fail(TransportError),
    /// Never answers; returns `Cancelled` once the call is cancelled.
    Hang,
}

impl Reply {
    pub fn ok(output: impl Into<String>) -> Self {
        Self::Ok(output.into())
    }

    pub fn exit(code: i32, output: impl Into<String>) -> Self {
        Self::Exit(code, output.into())
    }
}

/// Replays queued replies in order, then repeats its fallback reply.
pub struct ScriptedProvider {
    id: String,
    kind: ProviderKind,
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: ProviderKind::Api,
            replies: Mutex::new(VecDeque::new()),
            fallback: Reply::ok("done"),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_replies(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(replies);
        self
    }

    /// Reply used once the queue is empty.
    pub fn with_fallback(mut self, reply: Reply) -> Self {
        self.fallback = reply;
        self
    }

    pub fn push(&self, reply: Reply) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
    }

    /// Every prompt received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait until at least `n` calls have been made.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<ProviderOutput, TransportError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.prompt.clone());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Ok(output) => {
                request.emit(&output);
                Ok(ProviderOutput::new(output, 0))
            }
            Reply::Exit(code, output) => {
                request.emit(&output);
                Ok(ProviderOutput::new(output, code))
            }
            Reply::Fail(error) => Err(error),
            Reply::Hang => {
                request.cancel.cancelled().await;
                Err(TransportError::Cancelled)
            }
        }
    }
}

// ===========================================================================
// Configuration builders
// ===========================================================================

/// An API provider entry. The command is never run by scripted providers.
pub fn provider_config(id: &str, priority: u32, max_retries: u32) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        priority,
        kind: ProviderKind::Api,
        max_retries,
        model_ids: Vec::new(),
        command: "true".to_string(),
        args: Vec::new(),
        model_flag: None,
        env: Default::default(),
    }
}

/// Default settings with the given providers; the first is the default.
pub fn harness_config(providers: Vec<ProviderConfig>) -> HarnessConfig {
    HarnessConfig {
        default_provider: providers.first().map(|p| p.id.clone()),
        providers,
        ..HarnessConfig::default()
    }
}

/// `a -> b -> c`, no gates.
pub fn linear_catalog(mode: Mode) -> StepCatalog {
    catalog(mode, &[("a", &[], false), ("b", &["a"], false), ("c", &["b"], false)])
}

/// Build a catalog from `(id, dependencies, gated)` triples.
pub fn catalog(mode: Mode, steps: &[(&str, &[&str], bool)]) -> StepCatalog {
    let steps = steps
        .iter()
        .map(|(id, deps, gate)| Step {
            id: (*id).to_string(),
            title: format!("Step {id}"),
            dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
            requires_gate_approval: *gate,
            prompt: Some(format!("do {id}")),
        })
        .collect();
    StepCatalog::new(mode, steps).expect("test catalog should be valid")
}

// ===========================================================================
// Test project
// ===========================================================================

/// A throwaway project directory with a `.tern` state directory.
pub struct TestProject {
    dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp project dir"),
            clock: Arc::new(ManualClock::default()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join(".tern")
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.state_dir())
    }

    pub fn store(&self) -> CheckpointStore {
        CheckpointStore::new(self.store_config())
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }

    /// A runner over `providers`, registered under their own ids.
    pub fn runner(
        &self,
        mode: Mode,
        config: HarnessConfig,
        catalog: StepCatalog,
        providers: &[Arc<ScriptedProvider>],
    ) -> HarnessRunner {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            let provider: Arc<dyn Provider> = Arc::clone(provider) as Arc<dyn Provider>;
            registry.register_arc(provider);
        }
        HarnessRunner::new(
            mode,
            self.path(),
            config,
            catalog,
            self.store(),
            registry,
            self.clock(),
        )
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
