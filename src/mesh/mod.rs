//! Peer mesh used to share counters between engine instances.
//!
//! Uses the chitchat library for gossip-based cluster membership and state
//! dissemination.

mod cluster;

pub use cluster::{Cluster, ClusterError, CounterKey};
