//! Decision table mapping limiter, detector and breaker signals to a decision.

use serde::{Deserialize, Serialize};

use super::action::{MitigationAction, MitigationDecision};
use crate::breaker::BreakerCheck;
use crate::detect::{DetectionSummary, DetectorSet};
use crate::error::{PalisadeError, Result};
use crate::ratelimit::{RateLimitVerdict, RuleSet};

/// Selector tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationConfig {
    /// Detection confidence at which the detector's severe action applies
    #[serde(default = "default_severe_confidence")]
    pub severe_confidence: f64,
    /// Delay prescribed with the `delay` action
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_severe_confidence() -> f64 {
    0.8
}

fn default_delay_ms() -> u64 {
    1000
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            severe_confidence: default_severe_confidence(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl MitigationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.severe_confidence) {
            return Err(PalisadeError::Config(
                "mitigation.severe_confidence must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Seconds until `reset_at`, rounded up.
pub fn retry_after_seconds(reset_at: u64, now: u64) -> u64 {
    reset_at.saturating_sub(now).div_ceil(1000)
}

/// Picks the base mitigation for a request. First matching row wins:
///
/// 1. breaker rejected the request: block
/// 2. strong detection: the detector's severe action
/// 3. a rate limit was exceeded: the rule's action
/// 4. otherwise: allow
#[derive(Debug, Clone)]
pub struct MitigationSelector {
    config: MitigationConfig,
    detectors: DetectorSet,
    rules: RuleSet,
}

impl MitigationSelector {
    pub fn new(config: MitigationConfig, detectors: DetectorSet, rules: RuleSet) -> Self {
        Self {
            config,
            detectors,
            rules,
        }
    }

    pub fn decide(
        &self,
        verdict: Option<&RateLimitVerdict>,
        detection: &DetectionSummary,
        breaker: &BreakerCheck,
        now: u64,
    ) -> MitigationDecision {
        if let BreakerCheck::Rejected { .. } = breaker {
            return MitigationDecision::circuit_breaker(breaker.retry_after_seconds());
        }

        let exceeded = verdict.filter(|v| v.exceeded());
        let retry_after = exceeded
            .map(|v| retry_after_seconds(v.outcome.reset_at, now))
            .unwrap_or(0);

        if let Some(best) = detection
            .best
            .filter(|best| best.confidence >= self.config.severe_confidence)
        {
            let action = self.detectors.get(best.attack_type).action;
            return self.with_delay(MitigationDecision::mitigate(
                action,
                format!("attack:{}", best.attack_type),
                retry_after,
            ));
        }

        if let Some(verdict) = exceeded {
            let rule_type = verdict.outcome.rule_type();
            let action = self.rules.get(rule_type).action;
            return self.with_delay(MitigationDecision::mitigate(
                action,
                format!("rate_limit:{}", rule_type),
                retry_after,
            ));
        }

        MitigationDecision::allow()
    }

    fn with_delay(&self, mut decision: MitigationDecision) -> MitigationDecision {
        if decision.action == MitigationAction::Delay {
            decision.delay_ms = self.config.delay_ms;
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{AttackType, DetectionResult};
    use crate::ratelimit::{LimitKey, RateLimitOutcome, RuleType};

    fn selector() -> MitigationSelector {
        MitigationSelector::new(
            MitigationConfig::default(),
            DetectorSet::default(),
            RuleSet::default(),
        )
    }

    fn verdict(rule_type: RuleType, exceeded: bool, reset_at: u64) -> RateLimitVerdict {
        RateLimitVerdict {
            outcome: RateLimitOutcome {
                key: LimitKey::new(rule_type, "10.0.0.1"),
                exceeded,
                current_count: 1000,
                effective_limit: 1000,
                remaining: 0,
                reset_at,
                penalty_level: 0,
            },
            evaluated: vec![rule_type],
        }
    }

    fn detection(attack_type: AttackType, confidence: f64) -> DetectionSummary {
        let result = DetectionResult {
            attack_type,
            confidence,
            detected: true,
        };
        DetectionSummary {
            results: vec![result],
            best: Some(result),
        }
    }

    #[test]
    fn test_breaker_wins_over_everything() {
        let breaker = BreakerCheck::Rejected {
            scope: "global".to_string(),
            retry_after_ms: 1500,
        };
        let decision = selector().decide(
            Some(&verdict(RuleType::Ip, true, 60_000)),
            &detection(AttackType::Volumetric, 0.9),
            &breaker,
            0,
        );

        assert!(!decision.allowed);
        assert_eq!(decision.action, MitigationAction::Block);
        assert_eq!(decision.reason, "circuit_breaker");
        assert_eq!(decision.retry_after_seconds, 2);
    }

    #[test]
    fn test_strong_detection_uses_detector_action() {
        let decision = selector().decide(
            Some(&verdict(RuleType::Ip, true, 60_000)),
            &detection(AttackType::Bot, 0.85),
            &BreakerCheck::Admitted,
            0,
        );

        assert_eq!(decision.action, MitigationAction::Captcha);
        assert_eq!(decision.reason, "attack:bot");
        assert_eq!(decision.retry_after_seconds, 60);
    }

    #[test]
    fn test_weak_detection_falls_through_to_rate_limit() {
        let decision = selector().decide(
            Some(&verdict(RuleType::User, true, 30_500)),
            &detection(AttackType::Bot, 0.5),
            &BreakerCheck::Admitted,
            0,
        );

        assert_eq!(decision.action, MitigationAction::RateLimit);
        assert_eq!(decision.reason, "rate_limit:user");
        assert_eq!(decision.retry_after_seconds, 31);
    }

    #[test]
    fn test_delay_rule_action() {
        let mut rules = RuleSet::default();
        rules.endpoint.action = MitigationAction::Delay;
        let selector = MitigationSelector::new(MitigationConfig::default(), DetectorSet::default(), rules);

        let decision = selector.decide(
            Some(&verdict(RuleType::Endpoint, true, 1_000)),
            &DetectionSummary::default(),
            &BreakerCheck::Admitted,
            0,
        );
        assert!(decision.allowed);
        assert_eq!(decision.delay_ms, 1000);
    }

    #[test]
    fn test_nothing_to_do() {
        let decision = selector().decide(
            Some(&verdict(RuleType::Ip, false, 60_000)),
            &DetectionSummary::default(),
            &BreakerCheck::Admitted,
            0,
        );
        assert_eq!(decision, MitigationDecision::allow());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_seconds(60_000, 0), 60);
        assert_eq!(retry_after_seconds(60_001, 0), 61);
        assert_eq!(retry_after_seconds(5, 10), 0);
    }
}
