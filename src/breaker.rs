//! Circuit breakers keyed by scope.
//!
//! Two scope kinds exist: the single `global` scope and one
//! `per_endpoint:<signature>` scope per endpoint. Breakers are created on
//! first failure, so healthy scopes cost nothing.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{PalisadeError, Result};

pub const GLOBAL_SCOPE: &str = "global";
const ENDPOINT_PREFIX: &str = "per_endpoint:";

/// Scope name for an endpoint signature.
pub fn endpoint_scope(signature: &str) -> String {
    format!("{}{}", ENDPOINT_PREFIX, signature)
}

/// Current state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Traffic flows; failures are being counted.
    Closed,
    /// Traffic is rejected until the recovery time elapses.
    Open,
    /// One probe is admitted to test recovery.
    HalfOpen,
}

/// Thresholds for one scope kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures inside the window that open the breaker
    pub failure_threshold: u32,
    /// How long an open breaker rejects traffic
    pub recovery_time_ms: u64,
    /// Rolling window failures are counted over
    pub failure_window_ms: u64,
}

impl BreakerConfig {
    fn validate(&self, scope: &str) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(PalisadeError::Config(format!(
                "breakers.{}.failure_threshold must be > 0",
                scope
            )));
        }
        if self.recovery_time_ms == 0 {
            return Err(PalisadeError::Config(format!(
                "breakers.{}.recovery_time_ms must be > 0",
                scope
            )));
        }
        if self.failure_window_ms == 0 {
            return Err(PalisadeError::Config(format!(
                "breakers.{}.failure_window_ms must be > 0",
                scope
            )));
        }
        Ok(())
    }
}

/// Breaker thresholds for both scope kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub global: BreakerConfig,
    pub per_endpoint: BreakerConfig,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            global: BreakerConfig {
                failure_threshold: 100,
                recovery_time_ms: 30_000,
                failure_window_ms: 60_000,
            },
            per_endpoint: BreakerConfig {
                failure_threshold: 10,
                recovery_time_ms: 30_000,
                failure_window_ms: 60_000,
            },
        }
    }
}

impl BreakerSettings {
    pub fn validate(&self) -> Result<()> {
        self.global.validate("global")?;
        self.per_endpoint.validate("per_endpoint")
    }

    fn for_scope(&self, scope: &str) -> &BreakerConfig {
        if scope.starts_with(ENDPOINT_PREFIX) {
            &self.per_endpoint
        } else {
            &self.global
        }
    }
}

/// Answer to [`CircuitBreakers::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerCheck {
    Admitted,
    Rejected { scope: String, retry_after_ms: u64 },
}

impl BreakerCheck {
    pub fn is_admitted(&self) -> bool {
        matches!(self, BreakerCheck::Admitted)
    }

    /// Whole seconds until a retry may succeed; at least 1 when rejected.
    pub fn retry_after_seconds(&self) -> u64 {
        match self {
            BreakerCheck::Admitted => 0,
            BreakerCheck::Rejected { retry_after_ms, .. } => retry_after_ms.div_ceil(1000).max(1),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failures: VecDeque<u64>,
    opened_at: u64,
    probe_started_at: Option<u64>,
    last_activity: u64,
}

impl Breaker {
    fn new(now: u64) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: 0,
            probe_started_at: None,
            last_activity: now,
        }
    }

    fn prune(&mut self, now: u64, window_ms: u64) {
        while let Some(&oldest) = self.failures.front() {
            if oldest.saturating_add(window_ms) <= now {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn trip(&mut self, now: u64) {
        self.state = BreakerState::Open;
        self.opened_at = now;
        self.probe_started_at = None;
    }
}

/// Registry of breakers, one per scope.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: DashMap<String, Breaker>,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakers {
    pub fn new(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
            clock,
        }
    }

    /// Decide whether a request may pass this scope.
    ///
    /// An open breaker whose recovery time has elapsed moves to half-open and
    /// admits the caller as its single probe. A probe that never resolves is
    /// replaced after another recovery period.
    pub fn check(&self, scope: &str) -> BreakerCheck {
        let Some(mut breaker) = self.breakers.get_mut(scope) else {
            return BreakerCheck::Admitted;
        };
        let config = self.settings.for_scope(scope);
        let now = self.clock.now_millis();
        breaker.last_activity = now;

        match breaker.state {
            BreakerState::Closed => BreakerCheck::Admitted,
            BreakerState::Open => {
                let elapsed = now.saturating_sub(breaker.opened_at);
                if elapsed >= config.recovery_time_ms {
                    info!(scope = %scope, "Circuit breaker half-open");
                    breaker.state = BreakerState::HalfOpen;
                    breaker.probe_started_at = Some(now);
                    BreakerCheck::Admitted
                } else {
                    BreakerCheck::Rejected {
                        scope: scope.to_string(),
                        retry_after_ms: config.recovery_time_ms - elapsed,
                    }
                }
            }
            BreakerState::HalfOpen => match breaker.probe_started_at {
                Some(started) if now.saturating_sub(started) < config.recovery_time_ms => {
                    BreakerCheck::Rejected {
                        scope: scope.to_string(),
                        retry_after_ms: config.recovery_time_ms - now.saturating_sub(started),
                    }
                }
                _ => {
                    breaker.probe_started_at = Some(now);
                    BreakerCheck::Admitted
                }
            },
        }
    }

    /// Count a failure against the scope, opening the breaker when the
    /// threshold is reached.
    pub fn record_failure(&self, scope: &str) {
        let config = self.settings.for_scope(scope);
        let now = self.clock.now_millis();
        let mut breaker = self
            .breakers
            .entry(scope.to_string())
            .or_insert_with(|| Breaker::new(now));
        breaker.last_activity = now;

        match breaker.state {
            BreakerState::HalfOpen => {
                warn!(scope = %scope, "Circuit breaker probe failed; reopening");
                breaker.trip(now);
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                breaker.failures.push_back(now);
                breaker.prune(now, config.failure_window_ms);
                if breaker.failures.len() >= config.failure_threshold as usize {
                    warn!(
                        scope = %scope,
                        failures = breaker.failures.len(),
                        recovery_time_ms = config.recovery_time_ms,
                        "Circuit breaker opened"
                    );
                    breaker.trip(now);
                }
            }
        }
    }

    /// Report a successful request through the scope.
    pub fn record_success(&self, scope: &str) {
        let Some(mut breaker) = self.breakers.get_mut(scope) else {
            return;
        };
        breaker.last_activity = self.clock.now_millis();
        if breaker.state == BreakerState::HalfOpen {
            info!(scope = %scope, "Circuit breaker closed");
            breaker.state = BreakerState::Closed;
            breaker.failures.clear();
            breaker.probe_started_at = None;
        }
    }

    pub fn state(&self, scope: &str) -> BreakerState {
        self.breakers
            .get(scope)
            .map(|breaker| breaker.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Scopes with a breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| entry.state != BreakerState::Closed)
            .count()
    }

    /// Drop closed breakers with no failures left in their window.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.breakers.len();
        self.breakers.retain(|scope, breaker| {
            if breaker.state != BreakerState::Closed {
                return true;
            }
            let window = self.settings.for_scope(scope).failure_window_ms;
            breaker.prune(now, window);
            !breaker.failures.is_empty() || now.saturating_sub(breaker.last_activity) < window
        });
        before.saturating_sub(self.breakers.len())
    }
}
