//! Counter store adapters.
//!
//! The engine keeps its detector counters in a [`CounterStore`]. Two
//! interchangeable backends exist: an in-process map and a gossip mesh whose
//! counts are shared by every node in the cluster.

mod memory;
mod mesh;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

pub use memory::MemoryCounterStore;
pub use mesh::MeshCounterStore;

/// Count observed for a key in its current fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the window, including this one
    pub count: u64,
    /// Epoch ms at which the window closes
    pub reset_at: u64,
}

/// Trait for counter store implementations.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to `key` in the window containing now and return the total.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Add one to each `(key, window)` pair, in order.
    ///
    /// Backends guarding shared state with a single lock override this to
    /// take it once per batch.
    async fn increment_all(&self, keys: &[(&str, Duration)]) -> Result<Vec<WindowCount>, StoreError> {
        let mut counts = Vec::with_capacity(keys.len());
        for (key, window) in keys {
            counts.push(self.increment(key, *window).await?);
        }
        Ok(counts)
    }

    /// Drop windows that can no longer be read. Returns how many were dropped.
    async fn purge_expired(&self) -> usize {
        0
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Start and end (epoch ms) of the fixed window containing `now`.
pub(crate) fn window_bounds(now: u64, window_ms: u64) -> (u64, u64) {
    let start = (now / window_ms) * window_ms;
    (start, start + window_ms)
}
