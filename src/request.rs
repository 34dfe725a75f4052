//! The normalized request descriptor handed to the engine by the service layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Anomaly score assumed when the caller's classifier supplied none.
pub const NEUTRAL_ANOMALY_SCORE: f64 = 0.5;

/// Everything the engine needs to know about one inbound request.
///
/// Built by the caller, evaluated once, then dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Client address
    pub origin: IpAddr,
    /// Authenticated user, if any
    #[serde(default)]
    pub user_id: Option<String>,
    /// API key identifier, if any
    #[serde(default)]
    pub api_key: Option<String>,
    /// HTTP method (or transport verb)
    pub method: String,
    /// Path template, e.g. `/users/{id}`
    pub path: String,
    /// Request body size in bytes
    #[serde(default)]
    pub payload_size: u64,
    /// Header snapshot
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// When the service layer received the request
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    /// External anomaly score in [0, 1]
    #[serde(default)]
    pub anomaly_score: Option<f64>,
    /// External bot-likelihood score in [0, 1]
    #[serde(default)]
    pub bot_score: Option<f64>,
    /// Concurrently open, slowly-draining connections from this origin
    #[serde(default)]
    pub slow_connections: u32,
    /// Run the attack detectors even when no limit is exceeded
    #[serde(default)]
    pub deep_analysis: bool,
}

impl RequestDescriptor {
    /// Create a descriptor with only the mandatory fields set.
    pub fn new(origin: IpAddr, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            origin,
            user_id: None,
            api_key: None,
            method: method.into(),
            path: path.into(),
            payload_size: 0,
            headers: HashMap::new(),
            received_at: None,
            anomaly_score: None,
            bot_score: None,
            slow_connections: 0,
            deep_analysis: false,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_anomaly_score(mut self, score: f64) -> Self {
        self.anomaly_score = Some(score);
        self
    }

    pub fn with_bot_score(mut self, score: f64) -> Self {
        self.bot_score = Some(score);
        self
    }

    pub fn with_slow_connections(mut self, count: u32) -> Self {
        self.slow_connections = count;
        self
    }

    pub fn with_deep_analysis(mut self) -> Self {
        self.deep_analysis = true;
        self
    }

    /// Method plus path template, e.g. `GET /users/{id}`.
    pub fn endpoint_signature(&self) -> String {
        format!("{} {}", self.method.to_ascii_uppercase(), self.path)
    }

    /// Anomaly score clamped to [0, 1]; neutral when absent or NaN.
    pub fn anomaly(&self) -> f64 {
        clamp_score(self.anomaly_score).unwrap_or(NEUTRAL_ANOMALY_SCORE)
    }

    /// Bot score clamped to [0, 1]; zero when absent or NaN.
    pub fn bot(&self) -> f64 {
        clamp_score(self.bot_score).unwrap_or(0.0)
    }
}

fn clamp_score(score: Option<f64>) -> Option<f64> {
    score.filter(|s| !s.is_nan()).map(|s| s.clamp(0.0, 1.0))
}
