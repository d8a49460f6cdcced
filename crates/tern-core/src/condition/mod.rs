//! Classification of raw provider output into one actionable [`Signal`].
//!
//! Checks run in a fixed precedence order:
//!
//! 1. rate limited
//! 2. needs user feedback (numbered questions under an input heading)
//! 3. work complete (completion phrase and nothing left to run)
//! 4. generic error (non-zero exit or error phrase)
//! 5. ok
//!
//! Matching is keyword based and therefore best effort. The vocabulary
//! comes from [`DetectionSettings`] so false positives can be tuned away
//! without code changes. Classification never fails: anything ambiguous is
//! `Ok`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use tern_store::models::Question;

use crate::config::DetectionSettings;
use crate::error::TransportError;

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:try again in|retry[- ]after:?|retry in|wait(?: for)?)\s*(\d+)\s*(hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)?\b",
    )
    .expect("RETRY_AFTER regex should compile")
});

static NUMBERED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)[.)]\s+(.+?)\s*$").expect("NUMBERED_LINE regex should compile")
});

/// The primary signal extracted from one provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Ok,
    WorkComplete,
    RateLimited { retry_after_secs: u64 },
    NeedsUserFeedback { questions: Vec<Question> },
    GenericError { message: String },
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::WorkComplete => "work_complete",
            Self::RateLimited { .. } => "rate_limited",
            Self::NeedsUserFeedback { .. } => "needs_user_feedback",
            Self::GenericError { .. } => "generic_error",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate_limited (retry after {retry_after_secs}s)")
            }
            Self::NeedsUserFeedback { questions } => {
                write!(f, "needs_user_feedback ({} question(s))", questions.len())
            }
            Self::GenericError { message } => write!(f, "generic_error: {message}"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConditionDetector {
    settings: DetectionSettings,
    default_rate_limit_secs: u64,
}

impl ConditionDetector {
    /// `default_rate_limit_secs` is used when a rate-limit message names no
    /// wait time.
    pub fn new(settings: DetectionSettings, default_rate_limit_secs: u64) -> Self {
        let lower = |items: Vec<String>| -> Vec<String> {
            items
                .into_iter()
                .map(|s| s.to_lowercase())
                .filter(|s| !s.trim().is_empty())
                .collect()
        };
        Self {
            settings: DetectionSettings {
                rate_limit_phrases: lower(settings.rate_limit_phrases),
                feedback_headings: lower(settings.feedback_headings),
                completion_phrases: lower(settings.completion_phrases),
                error_phrases: lower(settings.error_phrases),
                optional_markers: lower(settings.optional_markers),
                rate_limit_scan_lines: settings.rate_limit_scan_lines,
            },
            default_rate_limit_secs,
        }
    }

    /// Classify a provider response.
    ///
    /// `remaining_steps` is the number of steps that would still be left if
    /// this one succeeded.
    pub fn classify(&self, output: &str, exit_status: Option<i32>, remaining_steps: usize) -> Signal {
        let failed_exit = exit_status.is_some_and(|code| code != 0);

        if let Some(retry_after_secs) = self.rate_limit(output, failed_exit) {
            return Signal::RateLimited { retry_after_secs };
        }

        let questions = self.questions(output);
        if !questions.is_empty() {
            return Signal::NeedsUserFeedback { questions };
        }

        if remaining_steps == 0 && contains_any(&output.to_lowercase(), &self.settings.completion_phrases) {
            return Signal::WorkComplete;
        }

        if let Some(code) = exit_status.filter(|code| *code != 0) {
            let tail = last_meaningful_line(output).unwrap_or("no output");
            return Signal::GenericError {
                message: format!("provider exited with status {code}: {tail}"),
            };
        }

        if let Some(line) = self.error_line(output) {
            return Signal::GenericError {
                message: line.to_string(),
            };
        }

        Signal::Ok
    }

    /// Classify a failed invocation. Only the error text is available, so
    /// only a rate limit can be more specific than a generic error.
    pub fn classify_transport(&self, error: &TransportError) -> Signal {
        let text = error.to_string();
        if let Some(retry_after_secs) = self.rate_limit(&text, true) {
            return Signal::RateLimited { retry_after_secs };
        }
        Signal::GenericError { message: text }
    }

    // -- individual checks ------------------------------------------------

    fn rate_limit(&self, output: &str, failed_exit: bool) -> Option<u64> {
        let window = if failed_exit || self.settings.rate_limit_scan_lines == 0 {
            output.to_lowercase()
        } else {
            tail_lines(output, self.settings.rate_limit_scan_lines).to_lowercase()
        };
        if !contains_any(&window, &self.settings.rate_limit_phrases) {
            return None;
        }
        Some(retry_after_secs(&window).unwrap_or(self.default_rate_limit_secs))
    }

    fn questions(&self, output: &str) -> Vec<Question> {
        let mut questions = Vec::new();
        let mut under_heading = false;

        for line in output.lines() {
            let lowered = line.to_lowercase();
            if !under_heading {
                under_heading = contains_any(&lowered, &self.settings.feedback_headings);
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            match NUMBERED_LINE.captures(line) {
                Some(caps) => {
                    let Ok(number) = caps[1].parse::<u32>() else {
                        continue;
                    };
                    let text = caps[2].to_string();
                    let required = !contains_any(&lowered, &self.settings.optional_markers);
                    questions.push(Question {
                        number,
                        text,
                        required,
                    });
                }
                // Prose after the list ends it; prose before it is allowed.
                None if !questions.is_empty() => break,
                None => {}
            }
        }

        questions
    }

    fn error_line<'a>(&self, output: &'a str) -> Option<&'a str> {
        output
            .lines()
            .find(|line| contains_any(&line.to_lowercase(), &self.settings.error_phrases))
            .map(str::trim)
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

fn last_meaningful_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|l| !l.is_empty())
}

/// Wait time named in a rate-limit message, in seconds.
fn retry_after_secs(text: &str) -> Option<u64> {
    let caps = RETRY_AFTER.captures(text)?;
    let amount: u64 = caps[1].parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str().to_lowercase()) {
        Some(unit) if unit.starts_with('h') => 3600,
        Some(unit) if unit.starts_with('m') => 60,
        _ => 1,
    };
    Some(amount.saturating_mul(multiplier))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
