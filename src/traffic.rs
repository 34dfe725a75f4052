//! Process-wide traffic counters.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::mitigation::MitigationDecision;

/// Aggregates published on each tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrafficSnapshot {
    pub timestamp_ms: u64,
    pub total_requests: u64,
    pub allowed: u64,
    pub mitigated: u64,
    pub bytes_observed: u64,
    /// Requests per second since the previous tick
    pub requests_per_second: f64,
    pub active_keys: usize,
    pub open_breakers: usize,
}

#[derive(Debug, Default)]
struct TickMark {
    at_ms: u64,
    total: u64,
}

/// Lock-free request counters plus the last published snapshot.
#[derive(Debug, Default)]
pub struct TrafficAggregator {
    total: AtomicU64,
    allowed: AtomicU64,
    mitigated: AtomicU64,
    bytes: AtomicU64,
    last_tick: Mutex<Option<TickMark>>,
    snapshot: RwLock<TrafficSnapshot>,
}

impl TrafficAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one evaluated request.
    pub fn record(&self, decision: &MitigationDecision, payload_size: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_size, Ordering::Relaxed);
        if decision.is_allow() {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.mitigated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Recompute the published snapshot.
    pub fn tick(&self, now_ms: u64, active_keys: usize, open_breakers: usize) -> TrafficSnapshot {
        let total = self.total.load(Ordering::Relaxed);

        let requests_per_second = {
            let mut last = self.last_tick.lock();
            let rate = match last.as_ref() {
                Some(mark) if now_ms > mark.at_ms => {
                    total.saturating_sub(mark.total) as f64 * 1000.0 / (now_ms - mark.at_ms) as f64
                }
                _ => 0.0,
            };
            *last = Some(TickMark { at_ms: now_ms, total });
            rate
        };

        let snapshot = TrafficSnapshot {
            timestamp_ms: now_ms,
            total_requests: total,
            allowed: self.allowed.load(Ordering::Relaxed),
            mitigated: self.mitigated.load(Ordering::Relaxed),
            bytes_observed: self.bytes.load(Ordering::Relaxed),
            requests_per_second,
            active_keys,
            open_breakers,
        };
        *self.snapshot.write() = snapshot.clone();
        snapshot
    }

    /// The snapshot from the most recent tick.
    pub fn snapshot(&self) -> TrafficSnapshot {
        self.snapshot.read().clone()
    }
}
