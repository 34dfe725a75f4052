//! Sliding-window rate limiter over the five rule types.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::descriptor::{LimitKey, RuleType, GLOBAL_KEY};
use super::rules::LimitsConfig;
use super::state::RateLimitState;
use crate::clock::Clock;
use crate::request::RequestDescriptor;

/// Result of evaluating one `(rule type, key)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitOutcome {
    /// The state key that was evaluated
    pub key: LimitKey,
    /// Whether this request was over the limit
    pub exceeded: bool,
    /// Requests admitted in the current window
    pub current_count: u32,
    /// Limit in force after penalties, burst and floor
    pub effective_limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// Epoch ms when a slot frees up
    pub reset_at: u64,
    /// Number of violations recorded for this key
    pub penalty_level: u32,
}

impl RateLimitOutcome {
    pub fn rule_type(&self) -> RuleType {
        self.key.rule_type
    }
}

/// Result of evaluating a whole request.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitVerdict {
    /// The first exceeded outcome, or the tightest admitted one
    pub outcome: RateLimitOutcome,
    /// Rule types actually evaluated, in order
    pub evaluated: Vec<RuleType>,
}

impl RateLimitVerdict {
    pub fn exceeded(&self) -> bool {
        self.outcome.exceeded
    }
}

/// The sliding-window limiter.
///
/// State lives in a sharded map, so concurrent requests for unrelated keys
/// never contend on the same lock.
pub struct SlidingWindowLimiter {
    /// Per-key state, created lazily
    states: DashMap<LimitKey, RateLimitState>,
    /// Rules and tuning
    limits: LimitsConfig,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(limits: LimitsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: DashMap::new(),
            limits,
            clock,
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Evaluate a single rule type for a key value.
    pub fn evaluate(&self, rule_type: RuleType, key_value: &str, anomaly: f64) -> RateLimitOutcome {
        let now = self.clock.now_millis();
        let mut outcome = self.admit(LimitKey::new(rule_type, key_value), now, anomaly);
        if outcome.exceeded {
            self.reject(&mut outcome, now);
        }
        outcome
    }

    /// Evaluate a request against every applicable rule type in order.
    ///
    /// The first exceeded rule short-circuits: rules after it are neither
    /// evaluated nor charged, and the slots already taken for earlier rules
    /// are handed back. A rejected request therefore leaves only the
    /// violation on the rule that rejected it. When nothing is exceeded the
    /// outcome with the fewest remaining requests is reported.
    pub fn check_request(&self, request: &RequestDescriptor) -> RateLimitVerdict {
        let anomaly = request.anomaly();
        let now = self.clock.now_millis();
        let mut evaluated = Vec::with_capacity(RuleType::ORDER.len());
        let mut admitted: Vec<RateLimitOutcome> = Vec::with_capacity(RuleType::ORDER.len());

        for rule_type in RuleType::ORDER {
            let Some(key_value) = rule_type.key_for(request) else {
                continue;
            };

            let mut outcome = self.admit(LimitKey::new(rule_type, key_value), now, anomaly);
            evaluated.push(rule_type);

            if outcome.exceeded {
                for earlier in &admitted {
                    self.release(&earlier.key, now);
                }
                self.reject(&mut outcome, now);
                return RateLimitVerdict { outcome, evaluated };
            }
            admitted.push(outcome);
        }

        // min_by_key keeps the first of equal elements, so IP wins ties.
        let outcome = match admitted.into_iter().min_by_key(|outcome| outcome.remaining) {
            Some(outcome) => outcome,
            None => self.evaluate(RuleType::Global, GLOBAL_KEY, anomaly),
        };
        RateLimitVerdict { outcome, evaluated }
    }

    fn admit(&self, key: LimitKey, now: u64, anomaly: f64) -> RateLimitOutcome {
        let rule = self.limits.rules.get(key.rule_type);
        let window = {
            let mut state = self.states.entry(key.clone()).or_insert_with(|| {
                trace!(key = %key, "Creating rate limit state");
                RateLimitState::new(now)
            });
            state.try_admit(now, rule, &self.limits, anomaly)
        };

        RateLimitOutcome {
            key,
            exceeded: window.exceeded,
            current_count: window.current_count,
            effective_limit: window.effective_limit,
            remaining: window.remaining,
            reset_at: window.reset_at,
            penalty_level: window.penalty_level,
        }
    }

    fn reject(&self, outcome: &mut RateLimitOutcome, now: u64) {
        let rule = self.limits.rules.get(outcome.key.rule_type);
        if let Some(mut state) = self.states.get_mut(&outcome.key) {
            outcome.penalty_level = state.record_violation(now, rule, &self.limits);
        }

        debug!(
            key = %outcome.key,
            count = outcome.current_count,
            limit = outcome.effective_limit,
            penalties = outcome.penalty_level,
            "Rate limit exceeded"
        );
    }

    fn release(&self, key: &LimitKey, now: u64) {
        if let Some(mut state) = self.states.get_mut(key) {
            state.release(now);
        }
    }

    /// Drop state for keys idle longer than their window × retention factor.
    ///
    /// Walks the map shard by shard; returns the number of keys evicted.
    pub fn evict_stale(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.states.len();
        let factor = u64::from(self.limits.retention_factor);

        self.states.retain(|key, state| {
            let retention = self.limits.rules.get(key.rule_type).window_ms.saturating_mul(factor);
            !state.is_stale(now, retention)
        });

        let evicted = before.saturating_sub(self.states.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.states.len(), "Evicted stale rate limit state");
        }
        evicted
    }

    /// Penalties recorded for a key, if it has state.
    pub fn penalties(&self, key: &LimitKey) -> Option<u32> {
        self.states.get(key).map(|state| state.penalties())
    }

    /// Number of keys with live state.
    pub fn active_keys(&self) -> usize {
        self.states.len()
    }

    /// Clear all state.
    pub fn clear(&self) {
        self.states.clear();
    }
}
