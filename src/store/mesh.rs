//! Counter store shared across a gossip cluster.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{window_bounds, CounterStore, WindowCount};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::mesh::{Cluster, CounterKey};

/// A counter store backed by chitchat cluster state.
///
/// Counts converge as gossip spreads, so a node may briefly under-count
/// traffic seen elsewhere; it never over-counts its own.
///
/// Chitchat guards all node state with one mutex. Batches through
/// [`CounterStore::increment_all`] take it once, and windows this node has
/// published are withdrawn by [`CounterStore::purge_expired`] once they end.
pub struct MeshCounterStore {
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
    /// Windows this node has published, with their end (epoch ms)
    published: DashMap<CounterKey, u64>,
}

impl MeshCounterStore {
    pub fn new(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cluster,
            clock,
            published: DashMap::new(),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Windows this node currently publishes.
    pub fn published_windows(&self) -> usize {
        self.published.len()
    }

    fn window_key(&self, key: &str, window: Duration, now: u64) -> Result<(CounterKey, u64), StoreError> {
        let window_ms = window.as_millis() as u64;
        if window_ms == 0 {
            return Err(StoreError::InvalidWindow(key.to_string()));
        }
        let (window_start, window_end) = window_bounds(now, window_ms);
        let counter_key = CounterKey::new(key, window_start);
        self.published.entry(counter_key.clone()).or_insert(window_end);
        Ok((counter_key, window_end))
    }
}

#[async_trait]
impl CounterStore for MeshCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let mut counts = self.increment_all(&[(key, window)]).await?;
        counts
            .pop()
            .ok_or_else(|| StoreError::Unavailable(format!("no count returned for {key}")))
    }

    async fn increment_all(&self, keys: &[(&str, Duration)]) -> Result<Vec<WindowCount>, StoreError> {
        let now = self.clock.now_millis();
        let mut counter_keys = Vec::with_capacity(keys.len());
        let mut resets = Vec::with_capacity(keys.len());
        for (key, window) in keys {
            let (counter_key, window_end) = self.window_key(key, *window, now)?;
            counter_keys.push(counter_key);
            resets.push(window_end);
        }

        let totals = self.cluster.increment_counters(&counter_keys, 1).await;
        trace!(keys = counter_keys.len(), "Incremented mesh counters");

        Ok(totals
            .into_iter()
            .zip(resets)
            .map(|(count, reset_at)| WindowCount { count, reset_at })
            .collect())
    }

    async fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut expired = Vec::new();
        self.published.retain(|key, window_end| {
            if *window_end <= now {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });

        self.cluster.remove_counters(&expired).await;
        if !expired.is_empty() {
            debug!(purged = expired.len(), "Withdrew expired mesh windows");
        }
        expired.len()
    }

    fn name(&self) -> &'static str {
        "mesh"
    }
}
