//! Rule types and the keys limiter state is indexed by.

use serde::{Deserialize, Serialize};

use crate::request::RequestDescriptor;

/// Key value used for the single global bucket.
pub const GLOBAL_KEY: &str = "*";

/// The scope a rate-limit rule applies to.
///
/// Declaration order is evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Ip,
    User,
    Endpoint,
    ApiKey,
    Global,
}

impl RuleType {
    /// All rule types in evaluation order.
    pub const ORDER: [RuleType; 5] = [
        RuleType::Ip,
        RuleType::User,
        RuleType::Endpoint,
        RuleType::ApiKey,
        RuleType::Global,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Ip => "ip",
            RuleType::User => "user",
            RuleType::Endpoint => "endpoint",
            RuleType::ApiKey => "api_key",
            RuleType::Global => "global",
        }
    }

    /// Extract the key value this rule type limits on, if the request carries one.
    pub fn key_for(&self, request: &RequestDescriptor) -> Option<String> {
        match self {
            RuleType::Ip => Some(request.origin.to_string()),
            RuleType::User => request.user_id.clone(),
            RuleType::Endpoint => Some(request.endpoint_signature()),
            RuleType::ApiKey => request.api_key.clone(),
            RuleType::Global => Some(GLOBAL_KEY.to_string()),
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one piece of limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// The rule type this key belongs to
    pub rule_type: RuleType,
    /// The value being limited (address, user id, signature, ...)
    pub value: String,
}

impl LimitKey {
    pub fn new(rule_type: RuleType, value: impl Into<String>) -> Self {
        Self {
            rule_type,
            value: value.into(),
        }
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rule_type, self.value)
    }
}
