//! Harness configuration schema.
//!
//! Loaded once at startup (the CLI resolves which file) and never reloaded
//! mid-run. Every section has defaults so a config file only needs its
//! `[[providers]]` tables.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors from parsing or validating a [`HarnessConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("configuration defines no providers")]
    NoProviders,

    #[error("duplicate provider id: {0}")]
    DuplicateProvider(String),

    #[error("default_provider {0:?} is not a configured provider")]
    UnknownDefaultProvider(String),

    #[error("provider {0:?} has an empty command")]
    EmptyCommand(String),

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Provider kind
// ---------------------------------------------------------------------------

/// How a provider is accessed. The kind decides how the prompt reaches the
/// provider command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Metered API access; prompt on stdin.
    Api,
    /// Subscription CLI (e.g. a logged-in agent CLI); prompt on stdin.
    Subscription,
    /// Generic command that takes the prompt as its final argument.
    CliPassthrough,
}

impl ProviderKind {
    pub fn prompt_on_stdin(self) -> bool {
        !matches!(self, Self::CliPassthrough)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Api => "api",
            Self::Subscription => "subscription",
            Self::CliPassthrough => "cli-passthrough",
        };
        f.write_str(s)
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(Self::Api),
            "subscription" => Ok(Self::Subscription),
            "cli-passthrough" | "passthrough" => Ok(Self::CliPassthrough),
            other => Err(format!("invalid provider kind: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// One configured AI provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: u32,
    pub kind: ProviderKind,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub model_ids: Vec<String>,
    /// Executable to run.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// When set, `<model_flag> <model_ids[0]>` is added to the arguments.
    #[serde(default)]
    pub model_flag: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    pub step_timeout_secs: u64,
    pub liveness_interval_secs: u64,
    /// Hard bound on attempts for one step across all providers.
    pub max_attempts_per_step: u32,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            step_timeout_secs: 1800,
            liveness_interval_secs: 15,
            max_attempts_per_step: 10,
        }
    }
}

impl HarnessSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }
}

/// Backoff and circuit-breaker tuning consumed by the error handler and
/// provider manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Rate-limit waits longer than this switch providers instead.
    pub rate_limit_ceiling_secs: u64,
    /// Used when a rate-limit message carries no retry time.
    pub default_rate_limit_secs: u64,
    pub circuit_cooldown_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_backoff_secs: 2,
            max_backoff_secs: 120,
            rate_limit_ceiling_secs: 600,
            default_rate_limit_secs: 60,
            circuit_cooldown_secs: 300,
        }
    }
}

/// Phrase lists for the condition detector. Matching is case-insensitive
/// substring matching, so entries should be lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub rate_limit_phrases: Vec<String>,
    pub feedback_headings: Vec<String>,
    pub completion_phrases: Vec<String>,
    pub error_phrases: Vec<String>,
    /// Marks a question as not required when present in its text.
    pub optional_markers: Vec<String>,
    /// Rate-limit phrases are only searched in the last N lines of output
    /// from a provider that exited cleanly. `0` searches everything.
    pub rate_limit_scan_lines: usize,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            rate_limit_phrases: strings(&[
                "rate limit",
                "rate-limit",
                "ratelimit",
                "too many requests",
                "quota exceeded",
                "usage limit",
                "http 429",
                "status 429",
                "error 429",
                "try again in",
                "retry after",
            ]),
            feedback_headings: strings(&[
                "i need your input",
                "input needed",
                "need your input",
                "questions for you",
                "please answer",
                "clarification needed",
                "need clarification",
                "awaiting your input",
            ]),
            completion_phrases: strings(&[
                "all steps finished",
                "all steps completed",
                "all steps complete",
                "work complete",
                "work is complete",
                "workflow complete",
                "all tasks completed",
                "completed successfully",
            ]),
            error_phrases: strings(&[
                "fatal error",
                "unhandled exception",
                "traceback (most recent call last)",
                "panicked at",
                "authentication failed",
                "internal server error",
            ]),
            optional_markers: strings(&["(optional)", "[optional]", "optional:"]),
            rate_limit_scan_lines: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub detection: DetectionSettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for HarnessConfig {
    /// A single subscription provider driving the `claude` CLI.
    fn default() -> Self {
        Self {
            default_provider: Some("claude".to_string()),
            harness: HarnessSettings::default(),
            retry: RetrySettings::default(),
            detection: DetectionSettings::default(),
            providers: vec![ProviderConfig {
                id: "claude".to_string(),
                priority: 1,
                kind: ProviderKind::Subscription,
                max_retries: default_max_retries(),
                model_ids: Vec::new(),
                command: "claude".to_string(),
                args: vec!["-p".to_string()],
                model_flag: Some("--model".to_string()),
                env: BTreeMap::new(),
            }],
        }
    }
}

impl HarnessConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.id.clone()));
            }
            if provider.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(provider.id.clone()));
            }
        }

        if let Some(default) = &self.default_provider {
            if !seen.contains(default.as_str()) {
                return Err(ConfigError::UnknownDefaultProvider(default.clone()));
            }
        }

        if self.harness.step_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "harness.step_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.harness.max_attempts_per_step == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "harness.max_attempts_per_step",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retry.max_backoff_secs < self.retry.base_backoff_secs {
            return Err(ConfigError::InvalidSetting {
                field: "retry.max_backoff_secs",
                reason: "must not be smaller than retry.base_backoff_secs".to_string(),
            });
        }

        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
