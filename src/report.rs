//! Security event reporting.
//!
//! Events are queued on a bounded channel and delivered by a background
//! worker, so a slow or failing sink never holds up request evaluation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ReportError;
use crate::mitigation::{MitigationAction, MitigationDecision};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RateLimited,
    AttackDetected,
    CircuitBreakerOpen,
    Escalated,
    StoreFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity of an event carrying the given action.
    pub fn for_action(action: MitigationAction) -> Self {
        match action {
            MitigationAction::Allow | MitigationAction::RateLimit | MitigationAction::Delay => Severity::Low,
            MitigationAction::Challenge | MitigationAction::Captcha | MitigationAction::ProofOfWork => {
                Severity::Medium
            }
            MitigationAction::Block | MitigationAction::Escalate => Severity::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub severity: Severity,
    pub scope_key: String,
    pub decision: Option<MitigationDecision>,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// An event that happened at `at_ms` (epoch ms).
    pub fn new(event_type: EventType, severity: Severity, scope_key: impl Into<String>, at_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity,
            scope_key: scope_key.into(),
            decision: None,
            timestamp: i64::try_from(at_ms)
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .unwrap_or_default(),
        }
    }

    pub fn with_decision(mut self, decision: MitigationDecision) -> Self {
        self.decision = Some(decision);
        self
    }
}

/// Destination for security events.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, event: &SecurityEvent) -> Result<(), ReportError>;
}

/// Discards every event.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

#[async_trait]
impl ReportSink for NullSink {
    async fn deliver(&self, _event: &SecurityEvent) -> Result<(), ReportError> {
        Ok(())
    }
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn deliver(&self, event: &SecurityEvent) -> Result<(), ReportError> {
        let payload = serde_json::to_string(event).map_err(|e| ReportError::Delivery(e.to_string()))?;
        info!(
            event_id = %event.id,
            event_type = ?event.event_type,
            severity = ?event.severity,
            scope_key = %event.scope_key,
            event = %payload,
            "security_event"
        );
        Ok(())
    }
}

/// Keeps events in memory for inspection.
///
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SecurityEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn deliver(&self, event: &SecurityEvent) -> Result<(), ReportError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Reporting bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Events buffered before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-event delivery budget
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Fire-and-forget front end for a [`ReportSink`].
///
/// Must be created inside a tokio runtime.
pub struct ReportingBridge {
    sender: RwLock<Option<mpsc::Sender<SecurityEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReportingBridge {
    pub fn new(sink: Arc<dyn ReportSink>, config: &ReportingConfig) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SecurityEvent>(config.queue_capacity.max(1));
        let timeout = Duration::from_millis(config.timeout_ms);
        let timeout_ms = config.timeout_ms;

        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let result = match tokio::time::timeout(timeout, sink.deliver(&event)).await {
                    Ok(result) => result,
                    Err(_) => Err(ReportError::Timeout(timeout_ms)),
                };
                if let Err(e) = result {
                    warn!(event_id = %event.id, error = %e, "Failed to deliver security event");
                }
            }
            debug!("Reporting worker stopped");
        });

        Self {
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an event. Never blocks; drops the event when the queue is full.
    pub fn report_event(&self, event: SecurityEvent) {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            debug!(event_id = %event.id, "Reporting bridge closed; event dropped");
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event_id = %event.id, "Reporting queue full; event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                error!(event_id = %event.id, "Reporting channel closed; event dropped");
            }
        }
    }

    /// Stop accepting events and wait for queued ones to be delivered.
    pub async fn shutdown(&self) {
        drop(self.sender.write().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Reporting worker failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl ReportSink for FailingSink {
        async fn deliver(&self, _event: &SecurityEvent) -> Result<(), ReportError> {
            Err(ReportError::Delivery("sink offline".to_string()))
        }
    }

    struct SlowSink;

    #[async_trait]
    impl ReportSink for SlowSink {
        async fn deliver(&self, _event: &SecurityEvent) -> Result<(), ReportError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn event() -> SecurityEvent {
        SecurityEvent::new(EventType::RateLimited, Severity::Low, "ip:10.0.0.1", 1_700_000_000_000)
    }

    #[test]
    fn test_event_timestamp_comes_from_caller() {
        let event = event();
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(event.timestamp.to_rfc3339(), "2023-11-14T22:13:20+00:00");
    }

    #[tokio::test]
    async fn test_events_delivered_before_shutdown_returns() {
        let sink = MemorySink::new();
        let bridge = ReportingBridge::new(Arc::new(sink.clone()), &ReportingConfig::default());

        for _ in 0..5 {
            bridge.report_event(event());
        }
        bridge.shutdown().await;

        assert_eq!(sink.len(), 5);
        assert_eq!(sink.events()[0].scope_key, "ip:10.0.0.1");
    }

    #[tokio::test]
    async fn test_events_after_shutdown_are_dropped() {
        let sink = MemorySink::new();
        let bridge = ReportingBridge::new(Arc::new(sink.clone()), &ReportingConfig::default());

        bridge.shutdown().await;
        bridge.report_event(event());
        bridge.shutdown().await;

        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_failing_sink_is_swallowed() {
        let bridge = ReportingBridge::new(Arc::new(FailingSink), &ReportingConfig::default());
        bridge.report_event(event());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_sink_times_out() {
        let config = ReportingConfig {
            queue_capacity: 4,
            timeout_ms: 10,
        };
        let bridge = ReportingBridge::new(Arc::new(SlowSink), &config);
        bridge.report_event(event());
        bridge.report_event(event());
        bridge.shutdown().await;
    }

    #[test]
    fn test_severity_for_action() {
        assert_eq!(Severity::for_action(MitigationAction::RateLimit), Severity::Low);
        assert_eq!(Severity::for_action(MitigationAction::ProofOfWork), Severity::Medium);
        assert_eq!(Severity::for_action(MitigationAction::Block), Severity::High);
    }

    #[test]
    fn test_event_serialization() {
        let event = event().with_decision(MitigationDecision::allow());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "rate_limited");
        assert_eq!(json["severity"], "low");
        assert_eq!(json["decision"]["action"], "allow");
    }
}
