//! Attack pattern detection.
//!
//! Detectors are pure functions of a [`TrafficStats`] snapshot. The suite runs
//! each one in isolation, so a detector that errors or panics only removes its
//! own vote, and reduces the results to the single most confident detection.

mod detectors;

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{DetectorError, PalisadeError, Result};
use crate::mitigation::MitigationAction;
use crate::request::RequestDescriptor;
use crate::store::WindowCount;

pub use detectors::{BotDetector, HttpFloodDetector, SlowConnectionDetector, VolumetricDetector};

/// Kinds of attack the built-in detectors recognise.
///
/// Declaration order breaks confidence ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    Volumetric,
    HttpFlood,
    SlowConnection,
    Bot,
}

impl AttackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackType::Volumetric => "volumetric",
            AttackType::HttpFlood => "http_flood",
            AttackType::SlowConnection => "slow_connection",
            AttackType::Bot => "bot",
        }
    }
}

impl std::fmt::Display for AttackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detector's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub attack_type: AttackType,
    pub confidence: f64,
    pub detected: bool,
}

impl DetectionResult {
    /// A negative result.
    pub fn clear(attack_type: AttackType) -> Self {
        Self {
            attack_type,
            confidence: 0.0,
            detected: false,
        }
    }

    /// Compare a measured value against a detector's threshold.
    pub fn measure(attack_type: AttackType, value: f64, config: &DetectorConfig) -> Self {
        if value >= config.threshold {
            Self {
                attack_type,
                confidence: config.confidence,
                detected: true,
            }
        } else {
            Self::clear(attack_type)
        }
    }
}

/// Rolling counters the detectors read.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrafficStats {
    /// Requests from the origin in the volumetric window
    pub requests_in_window: u64,
    /// Requests per second from the origin over the flood window
    pub requests_per_second: f64,
    /// Slowly-draining connections the origin holds open
    pub slow_connections: u32,
    /// External bot-likelihood score, when one was supplied
    pub bot_score: Option<f64>,
}

impl TrafficStats {
    /// Build a snapshot from the store counts taken for a request.
    pub fn from_counts(
        request: &RequestDescriptor,
        volumetric: WindowCount,
        flood: WindowCount,
        flood_window: Duration,
    ) -> Self {
        let seconds = flood_window.as_secs_f64().max(0.001);
        Self {
            requests_in_window: volumetric.count,
            requests_per_second: flood.count as f64 / seconds,
            slow_connections: request.slow_connections,
            bot_score: request.bot_score.map(|_| request.bot()),
        }
    }
}

/// A pluggable attack detector.
pub trait Detector: Send + Sync {
    fn attack_type(&self) -> AttackType;

    fn detect(&self, stats: &TrafficStats) -> std::result::Result<DetectionResult, DetectorError>;
}

/// Static configuration for one detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Value at or above which the detector fires
    pub threshold: f64,
    /// Counting window in milliseconds
    pub window_ms: u64,
    /// Confidence reported when the detector fires
    pub confidence: f64,
    /// Severe action applied on a strong detection
    pub action: MitigationAction,
}

impl DetectorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self, attack_type: AttackType) -> Result<()> {
        let fail = |reason: &str| {
            Err(PalisadeError::Config(format!(
                "invalid {} detector: {}",
                attack_type, reason
            )))
        };
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return fail("threshold must be a finite number > 0");
        }
        if self.window_ms == 0 {
            return fail("window_ms must be > 0");
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return fail("confidence must be within [0, 1]");
        }
        if self.action == MitigationAction::Allow {
            return fail("action must be a mitigation, not allow");
        }
        Ok(())
    }
}

/// Configuration for every built-in detector.
///
/// Detectors omitted from a config file keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSet {
    pub volumetric: DetectorConfig,
    pub http_flood: DetectorConfig,
    pub slow_connection: DetectorConfig,
    pub bot: DetectorConfig,
}

impl Default for DetectorSet {
    fn default() -> Self {
        Self {
            volumetric: DetectorConfig {
                threshold: 10_000.0,
                window_ms: 60_000,
                confidence: 0.9,
                action: MitigationAction::Block,
            },
            http_flood: DetectorConfig {
                threshold: 100.0,
                window_ms: 1_000,
                confidence: 0.85,
                action: MitigationAction::Challenge,
            },
            slow_connection: DetectorConfig {
                threshold: 50.0,
                window_ms: 30_000,
                confidence: 0.8,
                action: MitigationAction::Block,
            },
            bot: DetectorConfig {
                threshold: 0.8,
                window_ms: 60_000,
                confidence: 0.85,
                action: MitigationAction::Captcha,
            },
        }
    }
}

impl DetectorSet {
    pub fn get(&self, attack_type: AttackType) -> &DetectorConfig {
        match attack_type {
            AttackType::Volumetric => &self.volumetric,
            AttackType::HttpFlood => &self.http_flood,
            AttackType::SlowConnection => &self.slow_connection,
            AttackType::Bot => &self.bot,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.volumetric.validate(AttackType::Volumetric)?;
        self.http_flood.validate(AttackType::HttpFlood)?;
        self.slow_connection.validate(AttackType::SlowConnection)?;
        self.bot.validate(AttackType::Bot)
    }
}

/// All detector results for one request, plus the winning one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionSummary {
    pub results: Vec<DetectionResult>,
    /// Highest-confidence positive result; first declared wins ties
    pub best: Option<DetectionResult>,
}

impl DetectionSummary {
    pub fn is_attack(&self) -> bool {
        self.best.is_some()
    }

    fn reduce(results: Vec<DetectionResult>) -> Self {
        let best = results
            .iter()
            .filter(|result| result.detected)
            .fold(None::<DetectionResult>, |best, result| match best {
                Some(current) if current.confidence >= result.confidence => Some(current),
                _ => Some(*result),
            });
        Self { results, best }
    }
}

/// The ordered set of detectors run on the slow path.
pub struct DetectorSuite {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorSuite {
    /// The four built-in detectors in declaration order.
    pub fn new(config: &DetectorSet) -> Self {
        Self {
            detectors: vec![
                Box::new(VolumetricDetector::new(config.volumetric.clone())),
                Box::new(HttpFloodDetector::new(config.http_flood.clone())),
                Box::new(SlowConnectionDetector::new(config.slow_connection.clone())),
                Box::new(BotDetector::new(config.bot.clone())),
            ],
        }
    }

    /// A suite with exactly the given detectors.
    pub fn from_detectors(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    /// Append a detector after the existing ones.
    pub fn with_detector(mut self, detector: Box<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Run every detector and reduce to the most confident detection.
    pub fn run(&self, stats: &TrafficStats) -> DetectionSummary {
        let results = self
            .detectors
            .iter()
            .map(|detector| run_isolated(detector.as_ref(), stats))
            .collect();
        let summary = DetectionSummary::reduce(results);

        if let Some(best) = &summary.best {
            debug!(
                attack_type = %best.attack_type,
                confidence = best.confidence,
                "Attack pattern detected"
            );
        }
        summary
    }
}

fn run_isolated(detector: &dyn Detector, stats: &TrafficStats) -> DetectionResult {
    let attack_type = detector.attack_type();
    match catch_unwind(AssertUnwindSafe(|| detector.detect(stats))) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(attack_type = %attack_type, error = %e, "Detector failed; treating as clear");
            DetectionResult::clear(attack_type)
        }
        Err(_) => {
            error!(attack_type = %attack_type, "Detector panicked; treating as clear");
            DetectionResult::clear(attack_type)
        }
    }
}
