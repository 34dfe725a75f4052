//! Palisade - Adaptive Rate Limiting and DDoS Mitigation
//!
//! This crate implements an in-process mitigation engine. Each inbound request
//! is described by a [`RequestDescriptor`] and evaluated once; the engine
//! combines sliding-window rate limits, attack pattern detectors and circuit
//! breakers into a single [`MitigationDecision`]. Detector counters live in a
//! pluggable counter store, which can be shared across nodes through a
//! chitchat gossip mesh.

pub mod breaker;
pub mod clock;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod mesh;
pub mod mitigation;
pub mod ratelimit;
pub mod report;
pub mod request;
pub mod store;
pub mod traffic;

pub use config::PalisadeConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{PalisadeError, Result};
pub use mitigation::{MitigationAction, MitigationDecision};
pub use request::RequestDescriptor;
