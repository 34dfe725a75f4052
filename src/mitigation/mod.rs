//! Mitigation selection, escalation and execution.

mod action;
mod escalation;
mod executor;
mod selector;

pub use action::{
    MitigationAction, MitigationDecision, REASON_ALLOWED, REASON_CIRCUIT_BREAKER, REASON_STORE_UNAVAILABLE,
};
pub use escalation::{Escalation, EscalationConfig, EscalationLadder};
pub use executor::{ExecutionContext, MitigationExecutor};
pub use selector::{retry_after_seconds, MitigationConfig, MitigationSelector};
