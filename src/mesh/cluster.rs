//! Gossip membership and shared counters.
//!
//! A node never writes another node's state. Each counter window is stored
//! once per node as that node's own contribution, and readers add up the
//! contributions of every live member.

use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::MeshSettings;

const COUNTER_PREFIX: &str = "counter|";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Cluster failed to start: {0}")]
    Start(String),
    #[error("Cluster failed to leave: {0}")]
    Leave(String),
}

/// One windowed counter as it appears in node state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Store key, e.g. `volumetric:10.0.0.1`
    pub key: String,
    /// Epoch ms of the window boundary
    pub window_start: u64,
}

impl CounterKey {
    pub fn new(key: &str, window_start: u64) -> Self {
        Self {
            key: key.to_string(),
            window_start,
        }
    }

    /// Encoded as `counter|{key}|{window_start}`.
    pub fn encode(&self) -> String {
        format!("{COUNTER_PREFIX}{}|{}", self.key, self.window_start)
    }

    /// Store keys may contain `|`; the window is always the last segment.
    pub fn decode(raw: &str) -> Option<Self> {
        let (key, window) = raw.strip_prefix(COUNTER_PREFIX)?.rsplit_once('|')?;
        if key.is_empty() {
            return None;
        }
        Some(Self::new(key, window.parse().ok()?))
    }
}

/// A running member of the counter mesh.
pub struct Cluster {
    node_id: String,
    handle: ChitchatHandle,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("node_id", &self.node_id).finish()
    }
}

impl Cluster {
    /// Join the mesh described by `settings`. A random node id is used when
    /// none is configured, and the listen address is advertised by default.
    pub async fn start(settings: &MeshSettings) -> Result<Self, ClusterError> {
        let node_id = settings
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let advertise_addr = settings.advertise_addr.unwrap_or(settings.listen_addr);
        let gossip_interval = Duration::from_millis(settings.gossip_interval_ms);

        info!(
            node_id = %node_id,
            listen_addr = %settings.listen_addr,
            advertise_addr = %advertise_addr,
            seeds = settings.seed_nodes.len(),
            cluster_id = %settings.cluster_id,
            "Joining counter mesh"
        );

        let config = ChitchatConfig {
            chitchat_id: ChitchatId {
                node_id: node_id.clone(),
                generation_id: 0,
                gossip_advertise_addr: advertise_addr,
            },
            cluster_id: settings.cluster_id.clone(),
            gossip_interval,
            listen_addr: settings.listen_addr,
            seed_nodes: settings.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: Duration::from_secs(settings.dead_node_grace_period_secs),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(config, Vec::new(), &UdpTransport)
            .await
            .map_err(|e| ClusterError::Start(e.to_string()))?;

        Ok(Self { node_id, handle })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn state(&self) -> Arc<Mutex<Chitchat>> {
        self.handle.chitchat()
    }

    /// Raise this node's contribution to `key` by `amount` and return the
    /// mesh-wide total as currently known.
    pub async fn increment_counter(&self, key: &CounterKey, amount: u64) -> u64 {
        self.increment_counters(std::slice::from_ref(key), amount)
            .await
            .into_iter()
            .next()
            .unwrap_or(0)
    }

    /// [`Cluster::increment_counter`] for several keys under one lock.
    pub async fn increment_counters(&self, keys: &[CounterKey], amount: u64) -> Vec<u64> {
        let state = self.state();
        let mut chitchat = state.lock().await;

        let mut totals = Vec::with_capacity(keys.len());
        for key in keys {
            let encoded = key.encode();
            let own = chitchat.self_node_state();
            let contribution = own.get(&encoded).and_then(parse_count).unwrap_or(0) + amount;
            own.set(&encoded, contribution.to_string());

            debug!(key = %encoded, contribution, "Published counter contribution");
            totals.push(total(&chitchat, &encoded));
        }
        totals
    }

    /// Withdraw this node's contributions to `keys`. Peers drop them once the
    /// deletion has gossiped.
    pub async fn remove_counters(&self, keys: &[CounterKey]) {
        if keys.is_empty() {
            return;
        }
        let state = self.state();
        let mut chitchat = state.lock().await;
        let own = chitchat.self_node_state();
        for key in keys {
            own.delete(&key.encode());
        }
        debug!(removed = keys.len(), "Withdrew counter contributions");
    }

    pub async fn get_count(&self, key: &CounterKey) -> u64 {
        let state = self.state();
        let chitchat = state.lock().await;
        total(&chitchat, &key.encode())
    }

    pub async fn live_node_count(&self) -> usize {
        let state = self.state();
        let chitchat = state.lock().await;
        chitchat.live_nodes().count()
    }

    /// Leave the mesh and stop gossiping.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Leaving counter mesh");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::Leave(format!("{e:?}")))
    }
}

fn parse_count(raw: &str) -> Option<u64> {
    raw.parse().ok()
}

fn total(chitchat: &Chitchat, encoded: &str) -> u64 {
    chitchat
        .live_nodes()
        .filter_map(|id| chitchat.node_state(id)?.get(encoded).and_then(parse_count))
        .sum()
}
