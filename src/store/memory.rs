//! In-process counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{window_bounds, CounterStore, WindowCount};
use crate::clock::Clock;
use crate::error::StoreError;

/// A counter for one key in one fixed window.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    /// Current count in this window
    count: u64,
    /// When the current window started
    window_start: u64,
    /// When the current window ends
    window_end: u64,
}

impl WindowCounter {
    fn new(now: u64, window_ms: u64) -> Self {
        let (window_start, window_end) = window_bounds(now, window_ms);
        Self {
            count: 0,
            window_start,
            window_end,
        }
    }

    /// Roll over to the window containing `now` if the current one has ended.
    fn maybe_reset_window(&mut self, now: u64, window_ms: u64) {
        if now >= self.window_end {
            *self = Self::new(now, window_ms);
        }
    }

    fn increment(&mut self, now: u64, window_ms: u64) -> WindowCount {
        self.maybe_reset_window(now, window_ms);
        self.count += 1;
        WindowCount {
            count: self.count,
            reset_at: self.window_end,
        }
    }
}

/// Counter store backed by a sharded in-process map.
///
/// Atomic per key; never fails.
pub struct MemoryCounterStore {
    counters: DashMap<String, WindowCounter>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Current count for a key, if its window is still open.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        self.counters
            .get(key)
            .filter(|counter| now < counter.window_end)
            .map(|counter| counter.count)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let window_ms = window.as_millis() as u64;
        if window_ms == 0 {
            return Err(StoreError::InvalidWindow(key.to_string()));
        }

        let now = self.clock.now_millis();
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter::new(now, window_ms));
        let result = counter.increment(now, window_ms);

        trace!(
            key = %key,
            count = result.count,
            window_start = counter.window_start,
            "Incremented window counter"
        );
        Ok(result)
    }

    async fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.counters.len();
        self.counters.retain(|_, counter| now < counter.window_end);
        let purged = before.saturating_sub(self.counters.len());
        if purged > 0 {
            debug!(purged, "Purged expired window counters");
        }
        purged
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
