//! The mitigation engine.
//!
//! [`Engine::evaluate`] is the single entry point. Each request passes the
//! circuit breakers, bumps the detector counters in the counter store, is
//! checked against every rate limit, optionally runs the attack detectors,
//! and ends with one [`MitigationDecision`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::breaker::{endpoint_scope, BreakerCheck, CircuitBreakers, GLOBAL_SCOPE};
use crate::clock::{Clock, SystemClock};
use crate::config::PalisadeConfig;
use crate::detect::{DetectionSummary, DetectorSuite, TrafficStats};
use crate::error::{Result, StoreError};
use crate::mitigation::{
    EscalationLadder, ExecutionContext, MitigationDecision, MitigationExecutor, MitigationSelector,
};
use crate::ratelimit::{LimitKey, RateLimitVerdict, RuleType, SlidingWindowLimiter};
use crate::report::{LogSink, ReportSink, ReportingBridge};
use crate::request::RequestDescriptor;
use crate::store::{CounterStore, MemoryCounterStore, WindowCount};
use crate::traffic::{TrafficAggregator, TrafficSnapshot};

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub limiter_keys: usize,
    pub breakers: usize,
    pub incidents: usize,
    pub store_windows: usize,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: PalisadeConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn CounterStore>>,
    sink: Option<Arc<dyn ReportSink>>,
    detectors: Option<DetectorSuite>,
    background_tasks: bool,
}

impl EngineBuilder {
    pub fn new(config: PalisadeConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            sink: None,
            detectors: None,
            background_tasks: true,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Counter store; defaults to an in-process [`MemoryCounterStore`].
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Report sink; defaults to [`LogSink`].
    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the built-in detector suite.
    pub fn detectors(mut self, detectors: DetectorSuite) -> Self {
        self.detectors = Some(detectors);
        self
    }

    /// Skip the aggregation and cleanup tasks; callers drive them by hand.
    pub fn without_background_tasks(mut self) -> Self {
        self.background_tasks = false;
        self
    }

    /// Validate the configuration and start the engine.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let config = self.config;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCounterStore::new(clock.clone())) as Arc<dyn CounterStore>);
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(LogSink) as Arc<dyn ReportSink>);
        let detectors = self
            .detectors
            .unwrap_or_else(|| DetectorSuite::new(&config.detectors));

        let breakers = Arc::new(CircuitBreakers::new(config.breakers.clone(), clock.clone()));
        let traffic = Arc::new(TrafficAggregator::new());
        let reporter = Arc::new(ReportingBridge::new(sink, &config.reporting));
        let executor = MitigationExecutor::new(
            EscalationLadder::new(config.escalation.clone(), clock.clone()),
            breakers.clone(),
            traffic.clone(),
            reporter.clone(),
        );
        let selector = MitigationSelector::new(
            config.mitigation.clone(),
            config.detectors.clone(),
            config.limits.rules.clone(),
        );
        let limiter = SlidingWindowLimiter::new(config.limits.clone(), clock.clone());

        info!(
            store = store.name(),
            detectors = detectors.len(),
            "Mitigation engine initialized"
        );

        let inner = Arc::new(EngineInner {
            config,
            clock,
            store,
            limiter,
            detectors,
            breakers,
            selector,
            executor,
            traffic,
            reporter,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = if self.background_tasks {
            spawn_maintenance(&inner, shutdown_rx)
        } else {
            Vec::new()
        };

        Ok(Engine {
            inner,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

struct EngineInner {
    config: PalisadeConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn CounterStore>,
    limiter: SlidingWindowLimiter,
    detectors: DetectorSuite,
    breakers: Arc<CircuitBreakers>,
    selector: MitigationSelector,
    executor: MitigationExecutor,
    traffic: Arc<TrafficAggregator>,
    reporter: Arc<ReportingBridge>,
}

/// Adaptive rate limiting and DDoS mitigation engine.
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: PalisadeConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &PalisadeConfig {
        &self.inner.config
    }

    /// Decide what to do with one request. Never fails: internal errors
    /// degrade to an allowed decision.
    #[instrument(
        level = "debug",
        skip(self, request),
        fields(origin = %request.origin, method = %request.method, path = %request.path)
    )]
    pub async fn evaluate(&self, request: &RequestDescriptor) -> MitigationDecision {
        self.inner.evaluate(request).await
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.inner.breakers
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.inner.limiter
    }

    /// Snapshot from the latest aggregation tick.
    pub fn traffic_snapshot(&self) -> TrafficSnapshot {
        self.inner.traffic.snapshot()
    }

    /// Recompute traffic aggregates now.
    pub fn aggregate(&self) -> TrafficSnapshot {
        self.inner.aggregate()
    }

    /// Evict idle state now.
    pub async fn run_cleanup(&self) -> CleanupReport {
        self.inner.cleanup().await
    }

    /// Stop background tasks and flush queued security events.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.reporter.shutdown().await;
        info!("Mitigation engine stopped");
    }
}

impl EngineInner {
    async fn evaluate(&self, request: &RequestDescriptor) -> MitigationDecision {
        let now = self.clock.now_millis();
        let endpoint = endpoint_scope(&request.endpoint_signature());
        let origin_key = format!("ip:{}", request.origin);
        let context = |scope_key: String| ExecutionContext {
            scope_key,
            endpoint_scope: endpoint.clone(),
            payload_size: request.payload_size,
            now,
        };

        if let Some(rejected) = self.check_breakers(&endpoint) {
            let scope_key = match &rejected {
                BreakerCheck::Rejected { scope, .. } => scope.clone(),
                BreakerCheck::Admitted => origin_key,
            };
            let decision = self
                .selector
                .decide(None, &DetectionSummary::default(), &rejected, now);
            return self.executor.execute(decision, &context(scope_key));
        }

        if let Some((scope_key, decision)) = self.held(request, &origin_key) {
            return self.executor.execute_held(decision, &context(scope_key));
        }

        let (volumetric, flood) = match self.count_origin(request).await {
            Ok(counts) => counts,
            Err(e) => return self.executor.fail_open(&e, &context(origin_key)),
        };

        let verdict = self.limiter.check_request(request);
        let detection = if verdict.exceeded() || request.deep_analysis {
            let stats = TrafficStats::from_counts(
                request,
                volumetric,
                flood,
                self.config.detectors.http_flood.window(),
            );
            self.detectors.run(&stats)
        } else {
            DetectionSummary::default()
        };

        let decision = self
            .selector
            .decide(Some(&verdict), &detection, &BreakerCheck::Admitted, now);

        debug!(
            action = %decision.action,
            reason = %decision.reason,
            remaining = verdict.outcome.remaining,
            "Request evaluated"
        );

        let scope_key = incident_scope(&decision, &verdict, origin_key);
        self.executor.execute(decision, &context(scope_key))
    }

    fn check_breakers(&self, endpoint: &str) -> Option<BreakerCheck> {
        [GLOBAL_SCOPE, endpoint]
            .into_iter()
            .map(|scope| self.breakers.check(scope))
            .find(|check| !check.is_admitted())
    }

    /// First scope key of the request that is still serving a block.
    fn held(&self, request: &RequestDescriptor, origin_key: &str) -> Option<(String, MitigationDecision)> {
        let ladder = self.executor.ladder();
        if !ladder.has_holds() {
            return None;
        }

        std::iter::once(origin_key.to_string())
            .chain(RuleType::ORDER.into_iter().filter_map(|rule_type| {
                rule_type
                    .key_for(request)
                    .map(|value| LimitKey::new(rule_type, value).to_string())
            }))
            .find_map(|scope_key| ladder.held(&scope_key).map(|decision| (scope_key, decision)))
    }

    /// Bump the origin's volumetric and flood counters under the store timeout.
    async fn count_origin(
        &self,
        request: &RequestDescriptor,
    ) -> std::result::Result<(WindowCount, WindowCount), StoreError> {
        let detectors = &self.config.detectors;
        let volumetric_key = format!("volumetric:{}", request.origin);
        let flood_key = format!("flood:{}", request.origin);
        let keys = [
            (volumetric_key.as_str(), detectors.volumetric.window()),
            (flood_key.as_str(), detectors.http_flood.window()),
        ];

        let timeout = self.config.store.timeout();
        let counts = match tokio::time::timeout(timeout, self.store.increment_all(&keys)).await {
            Ok(result) => result?,
            Err(_) => return Err(StoreError::Timeout(self.config.store.timeout_ms)),
        };

        match counts.as_slice() {
            [volumetric, flood] => Ok((*volumetric, *flood)),
            other => Err(StoreError::Unavailable(format!(
                "expected 2 counts from {}, got {}",
                self.store.name(),
                other.len()
            ))),
        }
    }

    fn aggregate(&self) -> TrafficSnapshot {
        self.traffic.tick(
            self.clock.now_millis(),
            self.limiter.active_keys(),
            self.breakers.open_count(),
        )
    }

    async fn cleanup(&self) -> CleanupReport {
        let report = CleanupReport {
            limiter_keys: self.limiter.evict_stale(),
            breakers: self.breakers.evict_idle(),
            incidents: self.executor.ladder().evict_expired(),
            store_windows: self.store.purge_expired().await,
        };
        debug!(
            limiter_keys = report.limiter_keys,
            breakers = report.breakers,
            incidents = report.incidents,
            store_windows = report.store_windows,
            "Cleanup pass finished"
        );
        report
    }
}

/// Key an incident is tracked and reported under.
fn incident_scope(decision: &MitigationDecision, verdict: &RateLimitVerdict, origin_key: String) -> String {
    if decision.reason.starts_with("rate_limit:") {
        verdict.outcome.key.to_string()
    } else {
        origin_key
    }
}

fn spawn_maintenance(inner: &Arc<EngineInner>, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let maintenance = &inner.config.maintenance;
    let aggregation = Duration::from_millis(maintenance.aggregation_interval_ms);
    let cleanup = Duration::from_millis(maintenance.cleanup_interval_ms);

    let aggregator = {
        let inner = inner.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + aggregation, aggregation);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.aggregate();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Aggregation task stopped");
        })
    };

    let cleaner = {
        let inner = inner.clone();
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + cleanup, cleanup);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.cleanup().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Cleanup task stopped");
        })
    };

    vec![aggregator, cleaner]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::clock::ManualClock;
    use crate::detect::{AttackType, DetectionResult, Detector};
    use crate::error::DetectorError;
    use crate::mitigation::MitigationAction;
    use crate::report::{EventType, MemorySink};
    use async_trait::async_trait;
    use std::net::IpAddr;

    const START: u64 = 1_700_000_000_000;

    /// Config whose detectors stay quiet under test loads.
    fn quiet_config() -> PalisadeConfig {
        let mut config = PalisadeConfig::default();
        config.detectors.volumetric.threshold = 1_000_000.0;
        config.detectors.http_flood.threshold = 1_000_000.0;
        config
    }

    fn engine(config: PalisadeConfig, clock: &ManualClock, sink: &MemorySink) -> Engine {
        Engine::builder(config)
            .clock(Arc::new(clock.clone()))
            .sink(Arc::new(sink.clone()))
            .without_background_tasks()
            .build()
            .unwrap()
    }

    fn request(origin: &str) -> RequestDescriptor {
        RequestDescriptor::new(origin.parse::<IpAddr>().unwrap(), "GET", "/search")
    }

    struct Fixed(AttackType, f64);

    impl Detector for Fixed {
        fn attack_type(&self) -> AttackType {
            self.0
        }

        fn detect(&self, _stats: &TrafficStats) -> std::result::Result<DetectionResult, DetectorError> {
            Ok(DetectionResult {
                attack_type: self.0,
                confidence: self.1,
                detected: true,
            })
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _key: &str, _window: Duration) -> std::result::Result<WindowCount, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn increment(&self, _key: &str, _window: Duration) -> std::result::Result<WindowCount, StoreError> {
            futures::future::pending().await
        }

        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn test_request_over_ip_limit_is_rate_limited() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let engine = engine(quiet_config(), &clock, &sink);
        let req = request("203.0.113.7");

        for i in 1..=1000 {
            let decision = engine.evaluate(&req).await;
            assert!(decision.allowed, "request {} should be allowed", i);
        }

        let decision = engine.evaluate(&req).await;
        assert!(!decision.allowed);
        assert_eq!(decision.action, MitigationAction::RateLimit);
        assert_eq!(decision.reason, "rate_limit:ip");
        assert_eq!(decision.retry_after_seconds, 60);
        assert_eq!(decision.escalation_level, 0);

        engine.shutdown().await;
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::RateLimited);
        assert_eq!(events[0].scope_key, "ip:203.0.113.7");
        assert_eq!(events[0].timestamp.timestamp_millis(), START as i64);
    }

    #[tokio::test]
    async fn test_block_is_held_after_rate_window_slides() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let mut config = quiet_config();
        config.limits.rules.ip.max_requests = 10;
        config.breakers.per_endpoint.failure_threshold = 1_000;
        let engine = engine(config, &clock, &sink);
        let req = request("198.51.100.77");

        let mut last = MitigationDecision::allow();
        for _ in 0..17 {
            last = engine.evaluate(&req).await;
        }
        assert_eq!(last.action, MitigationAction::Block);
        assert_eq!(last.retry_after_seconds, 300);

        clock.advance(61_000);
        let held = engine.evaluate(&req).await;
        assert!(!held.allowed);
        assert_eq!(held.action, MitigationAction::Block);
        assert_eq!(held.reason, "rate_limit:ip");
        assert_eq!(held.retry_after_seconds, 239);

        // Other origins are unaffected.
        assert!(engine.evaluate(&request("198.51.100.78")).await.allowed);

        clock.advance(239_000);
        assert!(engine.evaluate(&req).await.allowed);

        engine.shutdown().await;
        let held_event = sink
            .events()
            .into_iter()
            .find(|event| event.timestamp.timestamp_millis() == (START + 61_000) as i64)
            .unwrap();
        assert_eq!(held_event.scope_key, "ip:198.51.100.77");
        assert_eq!(held_event.event_type, EventType::RateLimited);
    }

    #[tokio::test]
    async fn test_promotions_trip_global_breaker() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let mut config = quiet_config();
        config.limits.rules.ip.max_requests = 10;
        config.breakers.global.failure_threshold = 2;
        config.breakers.per_endpoint.failure_threshold = 1_000;
        let engine = engine(config, &clock, &sink);
        let req = request("198.51.100.9");

        for _ in 0..15 {
            engine.evaluate(&req).await;
        }
        assert_eq!(engine.breakers().state(GLOBAL_SCOPE), BreakerState::Open);
        assert_eq!(
            engine.breakers().state(&endpoint_scope("GET /search")),
            BreakerState::Closed
        );

        let other = RequestDescriptor::new("192.0.2.80".parse().unwrap(), "POST", "/login");
        let decision = engine.evaluate(&other).await;
        assert_eq!(decision.reason, "circuit_breaker");
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_origin_requests_share_one_budget() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let mut config = quiet_config();
        config.limits.rules.ip.max_requests = 20;
        config.breakers.global.failure_threshold = 1_000;
        config.breakers.per_endpoint.failure_threshold = 1_000;
        let engine = Arc::new(engine(config, &clock, &sink));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.evaluate(&request("203.0.113.50")).await.allowed })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 20);
        assert_eq!(engine.aggregate().total_requests, 100);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeat_offender_escalates_and_trips_breaker() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let mut config = quiet_config();
        config.limits.rules.ip.max_requests = 10;
        config.breakers.per_endpoint.failure_threshold = 3;
        let engine = engine(config, &clock, &sink);
        let req = request("198.51.100.1");

        for _ in 0..10 {
            assert!(engine.evaluate(&req).await.allowed);
        }

        let mut actions = Vec::new();
        for _ in 0..6 {
            actions.push(engine.evaluate(&req).await.action);
        }
        assert_eq!(
            actions,
            vec![
                MitigationAction::RateLimit,
                MitigationAction::RateLimit,
                MitigationAction::RateLimit,
                MitigationAction::Challenge,
                MitigationAction::Challenge,
                MitigationAction::Challenge,
            ]
        );
        assert_eq!(
            engine.breakers().state(&endpoint_scope("GET /search")),
            BreakerState::Open
        );

        let decision = engine.evaluate(&request("192.0.2.50")).await;
        assert_eq!(decision.reason, "circuit_breaker");
        assert_eq!(decision.retry_after_seconds, 30);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_without_consuming_budget() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let mut config = quiet_config();
        config.breakers.global.failure_threshold = 1;
        config.breakers.global.recovery_time_ms = 10_000;
        let engine = engine(config, &clock, &sink);
        let req = request("10.1.1.1");

        engine.breakers().record_failure(GLOBAL_SCOPE);

        let decision = engine.evaluate(&req).await;
        assert!(!decision.allowed);
        assert_eq!(decision.action, MitigationAction::Block);
        assert_eq!(decision.reason, "circuit_breaker");
        assert_eq!(decision.retry_after_seconds, 10);
        assert_eq!(engine.limiter().active_keys(), 0);

        clock.advance(10_000);
        let probe = engine.evaluate(&req).await;
        assert!(probe.allowed);
        assert_eq!(engine.breakers().state(GLOBAL_SCOPE), BreakerState::Closed);

        engine.shutdown().await;
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::CircuitBreakerOpen);
    }

    #[tokio::test]
    async fn test_most_confident_detection_wins() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let suite = DetectorSuite::from_detectors(vec![
            Box::new(Fixed(AttackType::Volumetric, 0.8)),
            Box::new(Fixed(AttackType::HttpFlood, 0.9)),
        ]);
        let engine = Engine::builder(quiet_config())
            .clock(Arc::new(clock.clone()))
            .sink(Arc::new(sink.clone()))
            .detectors(suite)
            .without_background_tasks()
            .build()
            .unwrap();

        let quiet = engine.evaluate(&request("10.2.2.2")).await;
        assert!(quiet.allowed);

        let decision = engine.evaluate(&request("10.2.2.2").with_deep_analysis()).await;
        assert!(!decision.allowed);
        assert_eq!(decision.action, MitigationAction::Challenge);
        assert_eq!(decision.reason, "attack:http_flood");

        engine.shutdown().await;
        assert_eq!(sink.events()[0].event_type, EventType::AttackDetected);
    }

    #[tokio::test]
    async fn test_flood_detection_on_exceeded_path() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let mut config = PalisadeConfig::default();
        config.limits.rules.ip.max_requests = 50;
        config.breakers.per_endpoint.failure_threshold = 1_000;
        config.escalation.promote_after = 1_000;
        let engine = engine(config, &clock, &sink);
        let req = request("10.3.3.3");

        for _ in 0..50 {
            assert!(engine.evaluate(&req).await.allowed);
        }
        let decision = engine.evaluate(&req).await;
        assert_eq!(decision.action, MitigationAction::RateLimit);

        for _ in 0..60 {
            engine.evaluate(&req).await;
        }
        let decision = engine.evaluate(&req).await;
        assert_eq!(decision.reason, "attack:http_flood");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_with_one_report() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let engine = Engine::builder(quiet_config())
            .clock(Arc::new(clock.clone()))
            .sink(Arc::new(sink.clone()))
            .store(Arc::new(BrokenStore))
            .without_background_tasks()
            .build()
            .unwrap();

        let decision = engine.evaluate(&request("10.4.4.4")).await;
        assert!(decision.allowed);
        assert_eq!(decision.action, MitigationAction::Allow);
        assert_eq!(decision.reason, "store_unavailable");

        engine.shutdown().await;
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::StoreFailure);
    }

    #[tokio::test]
    async fn test_store_timeout_fails_open() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let mut config = quiet_config();
        config.store.timeout_ms = 5;
        let engine = Engine::builder(config)
            .clock(Arc::new(clock.clone()))
            .sink(Arc::new(sink.clone()))
            .store(Arc::new(HangingStore))
            .without_background_tasks()
            .build()
            .unwrap();

        let decision = engine.evaluate(&request("10.5.5.5")).await;
        assert!(decision.allowed);
        assert_eq!(decision.reason, "store_unavailable");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_forgets_penalties() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let mut config = quiet_config();
        config.limits.rules.ip.max_requests = 10;
        config.breakers.per_endpoint.failure_threshold = 1_000;
        let engine = engine(config, &clock, &sink);
        let req = request("10.6.6.6");

        for _ in 0..30 {
            engine.evaluate(&req).await;
        }
        let key = LimitKey::new(RuleType::Ip, "10.6.6.6");
        assert!(engine.limiter().penalties(&key).unwrap() > 0);

        clock.advance(600_001);
        let report = engine.run_cleanup().await;
        assert!(report.limiter_keys >= 1);
        assert!(report.incidents >= 1);
        assert_eq!(engine.limiter().penalties(&key), None);

        for i in 1..=10 {
            assert!(engine.evaluate(&req).await.allowed, "request {} should be allowed", i);
        }
        let decision = engine.evaluate(&req).await;
        assert_eq!(decision.action, MitigationAction::RateLimit);
        assert_eq!(decision.escalation_level, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_aggregate_snapshot() {
        let clock = ManualClock::new(START);
        let sink = MemorySink::new();
        let engine = engine(quiet_config(), &clock, &sink);

        for _ in 0..4 {
            engine.evaluate(&request("10.7.7.7").with_user("alice")).await;
        }
        let snapshot = engine.aggregate();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.allowed, 4);
        assert_eq!(snapshot.active_keys, 4);
        assert_eq!(engine.traffic_snapshot(), snapshot);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let mut config = quiet_config();
        config.maintenance.aggregation_interval_ms = 10;
        config.maintenance.cleanup_interval_ms = 10;
        let engine = Engine::builder(config).sink(Arc::new(MemorySink::new())).build().unwrap();

        engine.evaluate(&request("10.8.8.8")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.traffic_snapshot().total_requests, 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = PalisadeConfig::default();
        config.limits.rules.ip.max_requests = 0;
        assert!(Engine::builder(config).build().is_err());
    }
}
