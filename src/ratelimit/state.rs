//! Per-key sliding window state.

use std::collections::VecDeque;

use super::rules::{LimitsConfig, RateLimitRule};

/// Mutable limiter state for one `(rule type, key)` pair.
///
/// Holds the timestamps of admitted requests still inside the window, so the
/// queue never grows past the effective limit.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Admission timestamps (epoch ms), oldest first
    timestamps: VecDeque<u64>,
    /// Number of rejected requests
    penalties: u32,
    /// Divides `max_requests`; starts at 1 and only grows
    adaptive_multiplier: f64,
    /// When the key last exceeded its limit
    last_violation: Option<u64>,
    /// Last time the key was observed at all
    last_seen: u64,
}

/// What a single observation decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowOutcome {
    pub exceeded: bool,
    pub current_count: u32,
    pub effective_limit: u32,
    pub remaining: u32,
    /// Epoch ms at which the oldest admitted request leaves the window
    pub reset_at: u64,
    pub penalty_level: u32,
}

impl RateLimitState {
    pub fn new(now: u64) -> Self {
        Self {
            timestamps: VecDeque::new(),
            penalties: 0,
            adaptive_multiplier: 1.0,
            last_violation: None,
            last_seen: now,
        }
    }

    pub fn penalties(&self) -> u32 {
        self.penalties
    }

    pub fn adaptive_multiplier(&self) -> f64 {
        self.adaptive_multiplier
    }

    pub fn last_violation(&self) -> Option<u64> {
        self.last_violation
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// The limit currently in force for this key.
    pub fn effective_limit(&self, rule: &RateLimitRule, limits: &LimitsConfig, anomaly: f64) -> u32 {
        let base = (f64::from(rule.max_requests) / self.adaptive_multiplier).floor() as u32;
        let limit = if anomaly < limits.low_anomaly_threshold {
            base.saturating_add(rule.burst_allowance)
        } else {
            base
        };
        limit.max(limits.min_effective_limit)
    }

    /// Record one request at `now` and report whether it fits the window.
    ///
    /// A request that does not fit counts as a violation.
    pub fn observe(
        &mut self,
        now: u64,
        rule: &RateLimitRule,
        limits: &LimitsConfig,
        anomaly: f64,
    ) -> WindowOutcome {
        let mut outcome = self.try_admit(now, rule, limits, anomaly);
        if outcome.exceeded {
            outcome.penalty_level = self.record_violation(now, rule, limits);
        }
        outcome
    }

    /// Append `now` if it fits the window. Nothing is recorded when it
    /// does not.
    pub fn try_admit(
        &mut self,
        now: u64,
        rule: &RateLimitRule,
        limits: &LimitsConfig,
        anomaly: f64,
    ) -> WindowOutcome {
        self.last_seen = now;
        self.prune(now, rule.window_ms);

        let effective_limit = self.effective_limit(rule, limits, anomaly);
        let in_window = self.timestamps.len() as u32;

        if in_window < effective_limit {
            self.timestamps.push_back(now);
            let current_count = in_window + 1;
            return WindowOutcome {
                exceeded: false,
                current_count,
                effective_limit,
                remaining: effective_limit - current_count,
                reset_at: self.reset_at(now, rule.window_ms),
                penalty_level: self.penalties,
            };
        }

        WindowOutcome {
            exceeded: true,
            current_count: in_window,
            effective_limit,
            remaining: 0,
            reset_at: self.reset_at(now, rule.window_ms),
            penalty_level: self.penalties,
        }
    }

    /// Count a rejected request against the key and return the new penalty
    /// level.
    pub fn record_violation(&mut self, now: u64, rule: &RateLimitRule, limits: &LimitsConfig) -> u32 {
        self.penalties = self.penalties.saturating_add(1);
        self.last_violation = Some(now);
        if self.penalties > limits.penalty_grace {
            // Past max_requests the floor binds anyway.
            self.adaptive_multiplier = (self.adaptive_multiplier * rule.penalty_multiplier)
                .min(f64::from(rule.max_requests).max(1.0));
        }
        self.penalties
    }

    /// Take back one admission made at `now`.
    pub fn release(&mut self, now: u64) -> bool {
        match self.timestamps.iter().rposition(|ts| *ts == now) {
            Some(index) => {
                self.timestamps.remove(index);
                true
            }
            None => false,
        }
    }

    /// Requests currently admitted in the window.
    pub fn admitted(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the key has been idle for longer than `retention_ms`.
    pub fn is_stale(&self, now: u64, retention_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) > retention_ms
    }

    fn prune(&mut self, now: u64, window_ms: u64) {
        while self
            .timestamps
            .front()
            .is_some_and(|ts| ts.saturating_add(window_ms) <= now)
        {
            self.timestamps.pop_front();
        }
    }

    fn reset_at(&self, now: u64, window_ms: u64) -> u64 {
        self.timestamps.front().map_or(now, |oldest| *oldest) + window_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    #[test]
    fn test_admits_up_to_limit() {
        let rule = RateLimitRule::new(Duration::from_secs(1), 20, 0, 2.0);
        let mut state = RateLimitState::new(0);

        for i in 1..=20 {
            let outcome = state.observe(100, &rule, &limits(), 0.5);
            assert!(!outcome.exceeded, "request {} should be admitted", i);
            assert_eq!(outcome.current_count, i);
        }

        let outcome = state.observe(100, &rule, &limits(), 0.5);
        assert!(outcome.exceeded);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(outcome.reset_at, 1100);
        assert_eq!(state.penalties(), 1);
    }

    #[test]
    fn test_window_slides() {
        let rule = RateLimitRule::new(Duration::from_secs(1), 10, 0, 2.0);
        let mut state = RateLimitState::new(0);

        for _ in 0..10 {
            state.observe(0, &rule, &limits(), 0.5);
        }
        assert!(state.observe(999, &rule, &limits(), 0.5).exceeded);

        // Everything admitted at t=0 is out of the window at t=1000.
        let outcome = state.observe(1000, &rule, &limits(), 0.5);
        assert!(!outcome.exceeded);
        assert_eq!(outcome.current_count, 1);
    }

    #[test]
    fn test_burst_only_for_low_anomaly() {
        let rule = RateLimitRule::new(Duration::from_secs(60), 100, 25, 1.5);
        let state = RateLimitState::new(0);

        assert_eq!(state.effective_limit(&rule, &limits(), 0.1), 125);
        assert_eq!(state.effective_limit(&rule, &limits(), 0.3), 100);
        assert_eq!(state.effective_limit(&rule, &limits(), 0.9), 100);
    }

    #[test]
    fn test_multiplier_grows_after_grace() {
        let rule = RateLimitRule::new(Duration::from_secs(60), 100, 0, 2.0);
        let mut state = RateLimitState::new(0);

        for _ in 0..100 {
            state.observe(0, &rule, &limits(), 0.5);
        }
        for _ in 0..5 {
            state.observe(0, &rule, &limits(), 0.5);
        }
        assert_eq!(state.adaptive_multiplier(), 1.0);

        state.observe(0, &rule, &limits(), 0.5);
        assert_eq!(state.penalties(), 6);
        assert_eq!(state.adaptive_multiplier(), 2.0);
        assert_eq!(state.effective_limit(&rule, &limits(), 0.5), 50);
        assert_eq!(state.last_violation(), Some(0));
    }

    #[test]
    fn test_effective_limit_monotonic_and_floored() {
        let rule = RateLimitRule::new(Duration::from_secs(60), 200, 0, 3.0);
        let mut state = RateLimitState::new(0);
        for _ in 0..200 {
            state.observe(0, &rule, &limits(), 0.5);
        }

        let mut previous = state.effective_limit(&rule, &limits(), 0.5);
        for _ in 0..50 {
            state.observe(0, &rule, &limits(), 0.5);
            let current = state.effective_limit(&rule, &limits(), 0.5);
            assert!(current <= previous);
            assert!(current >= limits().min_effective_limit);
            previous = current;
        }
        assert_eq!(previous, limits().min_effective_limit);
    }

    #[test]
    fn test_try_admit_records_nothing_on_rejection() {
        let rule = RateLimitRule::new(Duration::from_secs(60), 10, 0, 2.0);
        let mut state = RateLimitState::new(0);
        for _ in 0..10 {
            state.try_admit(0, &rule, &limits(), 0.5);
        }

        let outcome = state.try_admit(0, &rule, &limits(), 0.5);
        assert!(outcome.exceeded);
        assert_eq!(state.penalties(), 0);
        assert_eq!(state.admitted(), 10);

        assert_eq!(state.record_violation(0, &rule, &limits()), 1);
        assert_eq!(state.last_violation(), Some(0));
    }

    #[test]
    fn test_release_frees_a_slot() {
        let rule = RateLimitRule::new(Duration::from_secs(60), 10, 0, 2.0);
        let mut state = RateLimitState::new(0);
        for _ in 0..10 {
            state.observe(5, &rule, &limits(), 0.5);
        }

        assert!(state.release(5));
        assert!(!state.release(6));
        assert_eq!(state.admitted(), 9);
        assert!(!state.observe(5, &rule, &limits(), 0.5).exceeded);
    }

    #[test]
    fn test_staleness() {
        let state = RateLimitState::new(1_000);
        assert!(!state.is_stale(1_500, 1_000));
        assert!(state.is_stale(2_001, 1_000));
    }
}
