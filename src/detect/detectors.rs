//! Built-in threshold detectors.

use super::{AttackType, DetectionResult, Detector, DetectorConfig, TrafficStats};
use crate::error::DetectorError;

/// Total requests per origin over the volumetric window.
#[derive(Debug, Clone)]
pub struct VolumetricDetector {
    config: DetectorConfig,
}

impl VolumetricDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }
}

impl Detector for VolumetricDetector {
    fn attack_type(&self) -> AttackType {
        AttackType::Volumetric
    }

    fn detect(&self, stats: &TrafficStats) -> Result<DetectionResult, DetectorError> {
        Ok(DetectionResult::measure(
            AttackType::Volumetric,
            stats.requests_in_window as f64,
            &self.config,
        ))
    }
}

/// Requests per second over a short window.
#[derive(Debug, Clone)]
pub struct HttpFloodDetector {
    config: DetectorConfig,
}

impl HttpFloodDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }
}

impl Detector for HttpFloodDetector {
    fn attack_type(&self) -> AttackType {
        AttackType::HttpFlood
    }

    fn detect(&self, stats: &TrafficStats) -> Result<DetectionResult, DetectorError> {
        if !stats.requests_per_second.is_finite() {
            return Err(DetectorError::Failed(format!(
                "non-finite request rate {}",
                stats.requests_per_second
            )));
        }
        Ok(DetectionResult::measure(
            AttackType::HttpFlood,
            stats.requests_per_second,
            &self.config,
        ))
    }
}

/// Slowly-draining connections held open by the origin.
#[derive(Debug, Clone)]
pub struct SlowConnectionDetector {
    config: DetectorConfig,
}

impl SlowConnectionDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }
}

impl Detector for SlowConnectionDetector {
    fn attack_type(&self) -> AttackType {
        AttackType::SlowConnection
    }

    fn detect(&self, stats: &TrafficStats) -> Result<DetectionResult, DetectorError> {
        Ok(DetectionResult::measure(
            AttackType::SlowConnection,
            f64::from(stats.slow_connections),
            &self.config,
        ))
    }
}

/// Bot likelihood from an externally supplied score.
///
/// Without a score there is nothing to judge, so the result is clear.
#[derive(Debug, Clone)]
pub struct BotDetector {
    config: DetectorConfig,
}

impl BotDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }
}

impl Detector for BotDetector {
    fn attack_type(&self) -> AttackType {
        AttackType::Bot
    }

    fn detect(&self, stats: &TrafficStats) -> Result<DetectionResult, DetectorError> {
        Ok(match stats.bot_score {
            Some(score) => DetectionResult::measure(AttackType::Bot, score, &self.config),
            None => DetectionResult::clear(AttackType::Bot),
        })
    }
}
