//! Rate limit rules configuration and validation.
//!
//! One rule exists per [`RuleType`]; the set is loaded once at startup and
//! never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::descriptor::RuleType;
use crate::error::{PalisadeError, Result};
use crate::mitigation::MitigationAction;

/// A single rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Length of the sliding window in milliseconds
    pub window_ms: u64,
    /// Requests allowed per window before penalties
    pub max_requests: u32,
    /// Extra requests granted to callers with a low anomaly score
    #[serde(default)]
    pub burst_allowance: u32,
    /// Factor the adaptive multiplier grows by once penalties pass the grace count
    pub penalty_multiplier: f64,
    /// Mitigation applied when this rule is the binding one
    #[serde(default = "default_rule_action")]
    pub action: MitigationAction,
}

fn default_rule_action() -> MitigationAction {
    MitigationAction::RateLimit
}

impl RateLimitRule {
    pub fn new(window: Duration, max_requests: u32, burst_allowance: u32, penalty_multiplier: f64) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max_requests,
            burst_allowance,
            penalty_multiplier,
            action: default_rule_action(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self, rule_type: RuleType) -> Result<()> {
        if self.window_ms == 0 {
            return Err(invalid(rule_type, "window_ms must be > 0"));
        }
        if self.max_requests == 0 {
            return Err(invalid(rule_type, "max_requests must be > 0"));
        }
        if !self.penalty_multiplier.is_finite() || self.penalty_multiplier <= 1.0 {
            return Err(invalid(rule_type, "penalty_multiplier must be a finite number > 1"));
        }
        if self.action == MitigationAction::Allow {
            return Err(invalid(rule_type, "action must be a mitigation, not allow"));
        }
        Ok(())
    }
}

fn invalid(rule_type: RuleType, reason: &str) -> PalisadeError {
    PalisadeError::Config(format!("invalid {} rule: {}", rule_type, reason))
}

/// The full set of rules, one per rule type.
///
/// Every field is required when the section is present in a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub ip: RateLimitRule,
    pub user: RateLimitRule,
    pub endpoint: RateLimitRule,
    pub api_key: RateLimitRule,
    pub global: RateLimitRule,
}

impl Default for RuleSet {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            ip: RateLimitRule::new(minute, 1000, 100, 1.5),
            user: RateLimitRule::new(minute, 2000, 200, 1.5),
            endpoint: RateLimitRule::new(minute, 10_000, 1000, 1.2),
            api_key: RateLimitRule::new(minute, 5000, 500, 1.5),
            global: RateLimitRule::new(Duration::from_secs(1), 50_000, 0, 1.1),
        }
    }
}

impl RuleSet {
    /// Get the rule for a rule type.
    pub fn get(&self, rule_type: RuleType) -> &RateLimitRule {
        match rule_type {
            RuleType::Ip => &self.ip,
            RuleType::User => &self.user,
            RuleType::Endpoint => &self.endpoint,
            RuleType::ApiKey => &self.api_key,
            RuleType::Global => &self.global,
        }
    }

    /// Validate every rule, failing on the first invalid one.
    pub fn validate(&self) -> Result<()> {
        RuleType::ORDER
            .iter()
            .try_for_each(|rule_type| self.get(*rule_type).validate(*rule_type))
    }
}

/// Limiter-wide tuning shared by all rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard floor for the effective limit
    #[serde(default = "default_min_effective_limit")]
    pub min_effective_limit: u32,
    /// Anomaly scores below this earn the burst allowance
    #[serde(default = "default_low_anomaly_threshold")]
    pub low_anomaly_threshold: f64,
    /// Violations tolerated before the adaptive multiplier starts growing
    #[serde(default = "default_penalty_grace")]
    pub penalty_grace: u32,
    /// Idle state is evicted after `window × retention_factor`
    #[serde(default = "default_retention_factor")]
    pub retention_factor: u32,
    /// Per rule type limits
    #[serde(default)]
    pub rules: RuleSet,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_effective_limit: default_min_effective_limit(),
            low_anomaly_threshold: default_low_anomaly_threshold(),
            penalty_grace: default_penalty_grace(),
            retention_factor: default_retention_factor(),
            rules: RuleSet::default(),
        }
    }
}

fn default_min_effective_limit() -> u32 {
    10
}

fn default_low_anomaly_threshold() -> f64 {
    0.3
}

fn default_penalty_grace() -> u32 {
    5
}

fn default_retention_factor() -> u32 {
    5
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_effective_limit == 0 {
            return Err(PalisadeError::Config(
                "limits.min_effective_limit must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.low_anomaly_threshold) {
            return Err(PalisadeError::Config(
                "limits.low_anomaly_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.retention_factor == 0 {
            return Err(PalisadeError::Config(
                "limits.retention_factor must be > 0".to_string(),
            ));
        }
        self.rules.validate()
    }
}
