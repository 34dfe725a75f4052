//! Configuration management for Palisade.
//!
//! Every section has defaults, so an empty file yields a working engine.
//! [`PalisadeConfig::load`] layers `PALISADE__`-prefixed environment variables
//! over the file, e.g. `PALISADE__STORE__BACKEND=mesh`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::breaker::BreakerSettings;
use crate::detect::DetectorSet;
use crate::error::{PalisadeError, Result};
use crate::mitigation::{EscalationConfig, MitigationConfig};
use crate::ratelimit::LimitsConfig;
use crate::report::ReportingConfig;

/// Main configuration for the Palisade engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PalisadeConfig {
    /// Sliding-window rate limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Attack detector thresholds
    #[serde(default)]
    pub detectors: DetectorSet,

    /// Circuit breaker thresholds
    #[serde(default)]
    pub breakers: BreakerSettings,

    #[serde(default)]
    pub mitigation: MitigationConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Counter store backend
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Background task schedule
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Which counter store backs the detectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Mesh,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Budget for a single store call
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,

    /// Gossip settings, used by the mesh backend
    #[serde(default)]
    pub mesh: MeshSettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            timeout_ms: default_store_timeout_ms(),
            mesh: MeshSettings::default(),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    50
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Mesh cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSettings {
    /// Node identifier; a random one is generated when absent
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_mesh_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Peers used to bootstrap membership
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_dead_node_grace_period_secs")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_mesh_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            dead_node_grace_period_secs: default_dead_node_grace_period_secs(),
        }
    }
}

fn default_mesh_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "palisade".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_dead_node_grace_period_secs() -> u64 {
    3600
}

/// Background task schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How often traffic aggregates are recomputed
    #[serde(default = "default_aggregation_interval_ms")]
    pub aggregation_interval_ms: u64,

    /// How often idle state is evicted
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            aggregation_interval_ms: default_aggregation_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

fn default_aggregation_interval_ms() -> u64 {
    1000
}

fn default_cleanup_interval_ms() -> u64 {
    300_000
}

impl PalisadeConfig {
    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: PalisadeConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file overlaid with
    /// `PALISADE__` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PALISADE")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("store.mesh.seed_nodes")
                .try_parsing(true),
        );

        let config: PalisadeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on any invalid section.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        self.detectors.validate()?;
        self.breakers.validate()?;
        self.mitigation.validate()?;
        self.escalation.validate()?;

        if self.store.timeout_ms == 0 {
            return Err(PalisadeError::Config("store.timeout_ms must be > 0".to_string()));
        }
        if self.reporting.queue_capacity == 0 {
            return Err(PalisadeError::Config(
                "reporting.queue_capacity must be > 0".to_string(),
            ));
        }
        if self.maintenance.aggregation_interval_ms == 0 || self.maintenance.cleanup_interval_ms == 0 {
            return Err(PalisadeError::Config(
                "maintenance intervals must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitigation::MitigationAction;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = PalisadeConfig::from_yaml("{}").unwrap();
        assert_eq!(config, PalisadeConfig::default());
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.maintenance.cleanup_interval_ms, 300_000);
    }

    #[test]
    fn test_parse_sections() {
        let yaml = r#"
limits:
  min_effective_limit: 20
detectors:
  bot:
    threshold: 0.7
    window_ms: 60000
    confidence: 0.95
    action: proof_of_work
breakers:
  per_endpoint:
    failure_threshold: 3
    recovery_time_ms: 1000
    failure_window_ms: 10000
escalation:
  ladder: [delay, captcha, block]
  promote_after: 2
store:
  backend: mesh
  timeout_ms: 25
  mesh:
    listen_addr: "127.0.0.1:9000"
    seed_nodes: ["127.0.0.1:9001"]
"#;
        let config = PalisadeConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limits.min_effective_limit, 20);
        assert_eq!(config.detectors.bot.action, MitigationAction::ProofOfWork);
        assert_eq!(config.detectors.volumetric, DetectorSet::default().volumetric);
        assert_eq!(config.breakers.per_endpoint.failure_threshold, 3);
        assert_eq!(config.breakers.global, BreakerSettings::default().global);
        assert_eq!(config.escalation.ladder[0], MitigationAction::Delay);
        assert_eq!(config.escalation.window_ms, 600_000);
        assert_eq!(config.store.backend, StoreBackend::Mesh);
        assert_eq!(config.store.timeout(), Duration::from_millis(25));

        let mesh = &config.store.mesh;
        assert_eq!(mesh.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(mesh.advertise_addr, None);
        assert_eq!(mesh.seed_nodes, vec!["127.0.0.1:9001".to_string()]);
        assert_eq!(mesh.cluster_id, "palisade");
    }

    #[test]
    fn test_invalid_sections_fail_fast() {
        assert_err!(PalisadeConfig::from_yaml("store:\n  timeout_ms: 0\n"));
        assert_err!(PalisadeConfig::from_yaml("escalation:\n  ladder: []\n"));
        assert_err!(PalisadeConfig::from_yaml("mitigation:\n  severe_confidence: 2.0\n"));
        assert_err!(PalisadeConfig::from_yaml("limits: [1, 2]\n"));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("palisade-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "mitigation:\n  delay_ms: 250\n").unwrap();

        let config = assert_ok!(PalisadeConfig::load(Some(&path)));
        assert_eq!(config.mitigation.delay_ms, 250);

        let config = PalisadeConfig::from_file(&path).unwrap();
        assert_eq!(config.mitigation.delay_ms, 250);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(PalisadeConfig::from_file("/nonexistent/palisade.yaml").is_err());
    }
}
