//! Provider selection and health tracking.
//!
//! Health is in-memory and per process: a fresh `ProviderManager` starts
//! with every provider available. A provider is selectable when it is
//! marked available, its circuit is closed and any rate limit has expired.
//! An open circuit closes again (with its failure count reset) once
//! `retry.circuit_cooldown_secs` have passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::config::{HarnessConfig, ProviderKind};
use crate::error::HarnessError;

/// How a failed attempt should affect a provider's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOutcome {
    /// Throttled; unavailable until `retry_after` has passed. Does not count
    /// toward the circuit breaker.
    RateLimited { retry_after: Duration },
    /// Ordinary failure; counts toward the circuit breaker.
    Error,
    /// The provider cannot work at all in this process (e.g. its command
    /// does not exist).
    Fatal,
}

/// Health of one configured provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub id: String,
    pub priority: u32,
    pub kind: ProviderKind,
    pub max_retries: u32,
    pub available: bool,
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl ProviderHealth {
    /// Strict availability at `now`: an open circuit is never available,
    /// even if its cooldown has elapsed but it has not been closed yet.
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        self.available && !self.circuit_open && self.rate_limited_until.is_none_or(|t| t <= now)
    }

    /// When this provider is expected to become selectable again, if it is
    /// currently blocked and will recover on its own.
    fn recovers_at(&self, now: DateTime<Utc>, cooldown: Duration) -> Option<DateTime<Utc>> {
        if !self.available {
            return None;
        }
        let limited = self.rate_limited_until.filter(|t| *t > now);
        let circuit = if self.circuit_open {
            self.circuit_opened_at.map(|at| clock::add(at, cooldown))
        } else {
            None
        };
        match (limited, circuit) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

pub struct ProviderManager {
    /// Sorted by priority; ties keep configuration order.
    providers: Vec<ProviderHealth>,
    default_provider: Option<String>,
    current: Option<String>,
    circuit_cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl ProviderManager {
    pub fn new(config: &HarnessConfig, clock: Arc<dyn Clock>) -> Self {
        let mut providers: Vec<ProviderHealth> = config
            .providers
            .iter()
            .map(|p| ProviderHealth {
                id: p.id.clone(),
                priority: p.priority,
                kind: p.kind,
                max_retries: p.max_retries,
                available: true,
                rate_limited_until: None,
                consecutive_failures: 0,
                circuit_open: false,
                circuit_opened_at: None,
                total_successes: 0,
                total_failures: 0,
            })
            .collect();
        providers.sort_by_key(|p| p.priority);

        Self {
            providers,
            default_provider: config.default_provider.clone(),
            current: None,
            circuit_cooldown: Duration::from_secs(config.retry.circuit_cooldown_secs),
            clock,
        }
    }

    /// The configured default, or the highest-priority provider.
    pub fn default_provider(&self) -> Option<&str> {
        self.default_provider
            .as_deref()
            .or_else(|| self.providers.first().map(|p| p.id.as_str()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    pub fn health(&self, id: &str) -> Option<&ProviderHealth> {
        self.find(id)
    }

    /// Every provider's health, in priority order.
    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        self.providers.clone()
    }

    pub fn max_retries(&self, id: &str) -> u32 {
        self.find(id).map_or(0, |p| p.max_retries)
    }

    pub fn is_available(&self, id: &str) -> bool {
        let now = self.clock.now();
        self.find(id).is_some_and(|p| p.is_available_at(now))
    }

    /// Close every circuit whose cooldown has elapsed.
    pub fn heal_circuits(&mut self) {
        let now = self.clock.now();
        let cooldown = self.circuit_cooldown;
        for provider in &mut self.providers {
            let Some(opened_at) = provider.circuit_opened_at else {
                continue;
            };
            if provider.circuit_open && clock::add(opened_at, cooldown) <= now {
                info!(provider = %provider.id, "circuit cooldown elapsed, closing circuit");
                provider.circuit_open = false;
                provider.circuit_opened_at = None;
                provider.consecutive_failures = 0;
            }
        }
    }

    /// Pick the provider for the next attempt.
    ///
    /// `preferred` (or the default when `None`) wins if it is available;
    /// otherwise the first available provider in priority order. Fails with
    /// [`HarnessError::NoProviderAvailable`] carrying the soonest expected
    /// recovery when nothing is available.
    pub fn select_provider(&mut self, preferred: Option<&str>) -> Result<String, HarnessError> {
        self.heal_circuits();
        let now = self.clock.now();

        let preferred = preferred
            .map(str::to_string)
            .or_else(|| self.default_provider().map(str::to_string));

        let chosen = preferred
            .as_deref()
            .and_then(|id| {
                if !self.contains(id) {
                    warn!(provider = id, "preferred provider is not configured, ignoring");
                }
                self.find(id).filter(|p| p.is_available_at(now))
            })
            .or_else(|| self.providers.iter().find(|p| p.is_available_at(now)))
            .map(|p| p.id.clone());

        match chosen {
            Some(id) => {
                if self.current.as_deref() != Some(id.as_str()) {
                    debug!(provider = %id, "selected provider");
                }
                self.current = Some(id.clone());
                Ok(id)
            }
            None => Err(HarnessError::NoProviderAvailable {
                resume_after: self.soonest_recovery(),
            }),
        }
    }

    /// Available providers other than `provider_id`, in priority order.
    pub fn fallback_chain(&mut self, provider_id: &str) -> Vec<String> {
        self.heal_circuits();
        let now = self.clock.now();
        self.providers
            .iter()
            .filter(|p| p.id != provider_id && p.is_available_at(now))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Soonest time any blocked provider recovers on its own. `None` if
    /// nothing is blocked or every blocked provider is permanently down.
    pub fn soonest_recovery(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.providers
            .iter()
            .filter(|p| !p.is_available_at(now))
            .filter_map(|p| p.recovers_at(now, self.circuit_cooldown))
            .min()
    }

    pub fn record_success(&mut self, provider_id: &str) {
        let Some(provider) = self.find_mut(provider_id) else {
            warn!(provider = provider_id, "success recorded for unknown provider");
            return;
        };
        provider.consecutive_failures = 0;
        provider.circuit_open = false;
        provider.circuit_opened_at = None;
        provider.rate_limited_until = None;
        provider.total_successes += 1;
    }

    pub fn record_failure(&mut self, provider_id: &str, outcome: ProviderOutcome) {
        let now = self.clock.now();
        let Some(provider) = self.find_mut(provider_id) else {
            warn!(provider = provider_id, "failure recorded for unknown provider");
            return;
        };
        provider.total_failures += 1;

        match outcome {
            ProviderOutcome::RateLimited { retry_after } => {
                let until = clock::add(now, retry_after);
                info!(provider = %provider.id, until = %until, "provider rate limited");
                provider.rate_limited_until = Some(until);
            }
            ProviderOutcome::Error => {
                provider.consecutive_failures += 1;
                if !provider.circuit_open && provider.consecutive_failures >= provider.max_retries {
                    warn!(
                        provider = %provider.id,
                        failures = provider.consecutive_failures,
                        "opening circuit"
                    );
                    provider.circuit_open = true;
                    provider.circuit_opened_at = Some(now);
                }
            }
            ProviderOutcome::Fatal => {
                warn!(provider = %provider.id, "provider marked unavailable for this run");
                provider.consecutive_failures += 1;
                provider.available = false;
            }
        }
    }

    fn find(&self, id: &str) -> Option<&ProviderHealth> {
        self.providers.iter().find(|p| p.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut ProviderHealth> {
        self.providers.iter_mut().find(|p| p.id == id)
    }
}

impl std::fmt::Debug for ProviderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderManager")
            .field("providers", &self.providers)
            .field("current", &self.current)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ProviderConfig;
    use std::collections::BTreeMap;

    fn provider(id: &str, priority: u32, max_retries: u32) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            priority,
            kind: ProviderKind::Api,
            max_retries,
            model_ids: Vec::new(),
            command: id.to_string(),
            args: Vec::new(),
            model_flag: None,
            env: BTreeMap::new(),
        }
    }

    fn manager(clock: Arc<ManualClock>) -> ProviderManager {
        let config = HarnessConfig {
            default_provider: None,
            providers: vec![provider("c", 3, 2), provider("a", 1, 2), provider("b", 2, 2)],
            ..HarnessConfig::default()
        };
        ProviderManager::new(&config, clock)
    }

    #[test]
    fn selects_by_priority_without_preference() {
        let clock = Arc::new(ManualClock::default());
        let mut m = manager(clock);
        assert_eq!(m.default_provider(), Some("a"));
        assert_eq!(m.select_provider(None).unwrap(), "a");
    }

    #[test]
    fn preferred_provider_wins_when_available() {
        let clock = Arc::new(ManualClock::default());
        let mut m = manager(clock);
        assert_eq!(m.select_provider(Some("c")).unwrap(), "c");
        assert_eq!(m.select_provider(Some("unknown")).unwrap(), "a");
    }

    #[test]
    fn rate_limit_expires_with_time() {
        let clock = Arc::new(ManualClock::default());
        let mut m = manager(clock.clone());
        m.record_failure(
            "a",
            ProviderOutcome::RateLimited {
                retry_after: Duration::from_secs(30),
            },
        );
        assert!(!m.is_available("a"));
        assert_eq!(m.health("a").unwrap().consecutive_failures, 0);
        assert_eq!(m.select_provider(Some("a")).unwrap(), "b");

        clock.advance(Duration::from_secs(30));
        assert!(m.is_available("a"));
        assert_eq!(m.select_provider(Some("a")).unwrap(), "a");
    }

    #[test]
    fn circuit_opens_at_max_retries_and_heals_after_cooldown() {
        let clock = Arc::new(ManualClock::default());
        let mut m = manager(clock.clone());
        m.record_failure("a", ProviderOutcome::Error);
        assert!(m.is_available("a"));
        m.record_failure("a", ProviderOutcome::Error);
        assert!(m.health("a").unwrap().circuit_open);
        assert!(!m.is_available("a"));
        assert_eq!(m.fallback_chain("b"), vec!["c".to_string()]);

        clock.advance(Duration::from_secs(300));
        assert_eq!(m.select_provider(None).unwrap(), "a");
        let health = m.health("a").unwrap();
        assert!(!health.circuit_open);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn success_resets_failures() {
        let clock = Arc::new(ManualClock::default());
        let mut m = manager(clock);
        m.record_failure("a", ProviderOutcome::Error);
        m.record_success("a");
        let health = m.health("a").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_failures, 1);
        assert_eq!(health.total_successes, 1);
    }

    #[test]
    fn fallback_chain_excludes_blocked_providers() {
        let clock = Arc::new(ManualClock::default());
        let mut m = manager(clock);
        m.record_failure(
            "b",
            ProviderOutcome::RateLimited {
                retry_after: Duration::from_secs(10),
            },
        );
        assert_eq!(m.fallback_chain("a"), vec!["c".to_string()]);
        m.record_failure("c", ProviderOutcome::Fatal);
        assert!(m.fallback_chain("a").is_empty());
    }

    #[test]
    fn exhausted_providers_report_soonest_recovery() {
        let clock = Arc::new(ManualClock::default());
        let start = clock.now();
        let mut m = manager(clock);
        for (id, secs) in [("a", 90), ("b", 30), ("c", 60)] {
            m.record_failure(
                id,
                ProviderOutcome::RateLimited {
                    retry_after: Duration::from_secs(secs),
                },
            );
        }
        match m.select_provider(None) {
            Err(HarnessError::NoProviderAvailable { resume_after }) => {
                assert_eq!(resume_after, Some(clock::add(start, Duration::from_secs(30))));
            }
            other => panic!("expected NoProviderAvailable, got {other:?}"),
        }
    }

    #[test]
    fn permanently_down_providers_have_no_recovery_time() {
        let clock = Arc::new(ManualClock::default());
        let mut m = manager(clock);
        for id in ["a", "b", "c"] {
            m.record_failure(id, ProviderOutcome::Fatal);
        }
        assert!(m.soonest_recovery().is_none());
        assert!(matches!(
            m.select_provider(None),
            Err(HarnessError::NoProviderAvailable { resume_after: None })
        ));
    }
}
