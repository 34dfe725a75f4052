//! Applies a selected decision: escalation, breaker feedback, counters and
//! security events.

use std::sync::Arc;
use tracing::{error, info, trace, warn};

use super::action::{MitigationAction, MitigationDecision};
use super::escalation::EscalationLadder;
use crate::breaker::{CircuitBreakers, GLOBAL_SCOPE};
use crate::error::StoreError;
use crate::report::{EventType, ReportingBridge, SecurityEvent, Severity};
use crate::traffic::TrafficAggregator;

/// Per-request facts the executor needs besides the decision itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Key the incident is tracked under, e.g. `ip:10.0.0.1`
    pub scope_key: String,
    /// Breaker scope of the request's endpoint
    pub endpoint_scope: String,
    pub payload_size: u64,
    /// Evaluation time (epoch ms); stamps security events
    pub now: u64,
}

pub struct MitigationExecutor {
    ladder: EscalationLadder,
    breakers: Arc<CircuitBreakers>,
    traffic: Arc<TrafficAggregator>,
    reporter: Arc<ReportingBridge>,
}

impl MitigationExecutor {
    pub fn new(
        ladder: EscalationLadder,
        breakers: Arc<CircuitBreakers>,
        traffic: Arc<TrafficAggregator>,
        reporter: Arc<ReportingBridge>,
    ) -> Self {
        Self {
            ladder,
            breakers,
            traffic,
            reporter,
        }
    }

    pub fn ladder(&self) -> &EscalationLadder {
        &self.ladder
    }

    /// Finalise a decision and record its side effects.
    ///
    /// Every promotion counts as a failure against both the endpoint and the
    /// global breaker.
    pub fn execute(&self, decision: MitigationDecision, context: &ExecutionContext) -> MitigationDecision {
        let escalation = self.ladder.apply(decision, &context.scope_key);
        let decision = escalation.decision;

        if escalation.promoted {
            self.breakers.record_failure(&context.endpoint_scope);
            self.breakers.record_failure(GLOBAL_SCOPE);
        } else if decision.allowed && !decision.is_circuit_breaker() {
            self.breakers.record_success(GLOBAL_SCOPE);
            self.breakers.record_success(&context.endpoint_scope);
        }

        self.settle(decision, escalation.promoted, context)
    }

    /// Answer a request whose scope key is serving a block. The incident is
    /// not counted again.
    pub fn execute_held(&self, decision: MitigationDecision, context: &ExecutionContext) -> MitigationDecision {
        self.settle(decision, false, context)
    }

    fn settle(&self, decision: MitigationDecision, promoted: bool, context: &ExecutionContext) -> MitigationDecision {
        self.traffic.record(&decision, context.payload_size);
        self.log(&decision, context);

        if !decision.is_allow() {
            let (event_type, severity) = classify(&decision, promoted);
            self.reporter.report_event(
                SecurityEvent::new(event_type, severity, context.scope_key.clone(), context.now)
                    .with_decision(decision.clone()),
            );
        }

        decision
    }

    /// Record a counter store failure and return the fail-open decision.
    pub fn fail_open(&self, err: &StoreError, context: &ExecutionContext) -> MitigationDecision {
        let decision = MitigationDecision::fail_open();
        error!(
            scope_key = %context.scope_key,
            error = %err,
            "Counter store unavailable; failing open"
        );
        self.traffic.record(&decision, context.payload_size);
        self.reporter.report_event(
            SecurityEvent::new(EventType::StoreFailure, Severity::High, context.scope_key.clone(), context.now)
                .with_decision(decision.clone()),
        );
        decision
    }

    fn log(&self, decision: &MitigationDecision, context: &ExecutionContext) {
        match decision.action {
            MitigationAction::Allow => {
                trace!(scope_key = %context.scope_key, "Request allowed");
            }
            MitigationAction::Block | MitigationAction::Escalate => {
                warn!(
                    scope_key = %context.scope_key,
                    action = %decision.action,
                    reason = %decision.reason,
                    retry_after_seconds = decision.retry_after_seconds,
                    escalation_level = decision.escalation_level,
                    "Request blocked"
                );
            }
            _ => {
                info!(
                    scope_key = %context.scope_key,
                    action = %decision.action,
                    reason = %decision.reason,
                    retry_after_seconds = decision.retry_after_seconds,
                    escalation_level = decision.escalation_level,
                    "Request mitigated"
                );
            }
        }
    }
}

fn classify(decision: &MitigationDecision, promoted: bool) -> (EventType, Severity) {
    if decision.is_circuit_breaker() {
        return (EventType::CircuitBreakerOpen, Severity::Critical);
    }
    let severity = Severity::for_action(decision.action);
    let event_type = if promoted {
        EventType::Escalated
    } else if decision.reason.starts_with("attack:") {
        EventType::AttackDetected
    } else {
        EventType::RateLimited
    };
    (event_type, severity)
}
