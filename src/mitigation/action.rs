//! Mitigation actions and the decision returned to callers.

use serde::{Deserialize, Serialize};

pub const REASON_ALLOWED: &str = "allowed";
pub const REASON_CIRCUIT_BREAKER: &str = "circuit_breaker";
pub const REASON_STORE_UNAVAILABLE: &str = "store_unavailable";

/// Responses the engine can prescribe, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationAction {
    Allow,
    RateLimit,
    Delay,
    Challenge,
    Captcha,
    ProofOfWork,
    Block,
    Escalate,
}

impl MitigationAction {
    /// Severity rank; higher is harsher.
    pub fn severity(&self) -> u8 {
        *self as u8
    }

    /// Whether the request still goes through under this action.
    pub fn admits(&self) -> bool {
        matches!(self, MitigationAction::Allow | MitigationAction::Delay)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MitigationAction::Allow => "allow",
            MitigationAction::RateLimit => "rate_limit",
            MitigationAction::Delay => "delay",
            MitigationAction::Challenge => "challenge",
            MitigationAction::Captcha => "captcha",
            MitigationAction::ProofOfWork => "proof_of_work",
            MitigationAction::Block => "block",
            MitigationAction::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for MitigationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MitigationDecision {
    pub allowed: bool,
    pub action: MitigationAction,
    pub reason: String,
    pub retry_after_seconds: u64,
    pub escalation_level: u32,
    #[serde(default)]
    pub delay_ms: u64,
}

impl MitigationDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            action: MitigationAction::Allow,
            reason: REASON_ALLOWED.to_string(),
            retry_after_seconds: 0,
            escalation_level: 0,
            delay_ms: 0,
        }
    }

    /// The decision used when the counter store cannot be consulted.
    pub fn fail_open() -> Self {
        Self {
            reason: REASON_STORE_UNAVAILABLE.to_string(),
            ..Self::allow()
        }
    }

    pub fn circuit_breaker(retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            action: MitigationAction::Block,
            reason: REASON_CIRCUIT_BREAKER.to_string(),
            retry_after_seconds,
            escalation_level: 0,
            delay_ms: 0,
        }
    }

    /// A mitigation decision; `allowed` follows from the action.
    pub fn mitigate(action: MitigationAction, reason: impl Into<String>, retry_after_seconds: u64) -> Self {
        Self {
            allowed: action.admits(),
            action,
            reason: reason.into(),
            retry_after_seconds,
            escalation_level: 0,
            delay_ms: 0,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.action == MitigationAction::Allow
    }

    pub fn is_circuit_breaker(&self) -> bool {
        self.reason == REASON_CIRCUIT_BREAKER
    }
}
