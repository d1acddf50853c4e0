//! redfleet.toml configuration parser.
//!
//! Every field has a default, so the daemon runs with no config file at
//! all. Durations are expressed in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Environment variable that overrides `store.endpoint` at start-up.
///
/// Lets a containerised scheduler reach the store on a local address while
/// executors are configured with the externally visible one.
pub const STORE_ENDPOINT_ENV: &str = "REDFLEET_LOCAL_STORE_ENDPOINT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    /// OS user the executors run as.
    pub user_name: String,
    /// Name registered with the cluster scheduler.
    pub framework_name: String,
    /// Cluster scheduler master endpoint (`host:port` or `zk://...`).
    pub master: String,
    /// Executor binary served to agents.
    pub executor_path: String,
    /// Redis image new instances run.
    pub redis_image: String,
    /// Address the executor artifact server binds to.
    pub artifact_ip: String,
    pub artifact_port: u16,
    /// Port of the HTTP gateway.
    pub http_port: u16,
    /// `text` or `json`.
    pub log_format: String,
    pub store: StoreConfig,
    pub reconciler: ReconcilerConfig,
    pub cluster: ClusterConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            user_name: "ubuntu".to_string(),
            framework_name: "RedFleet".to_string(),
            master: "127.0.0.1:5050".to_string(),
            executor_path: "./RedFleetExecutor".to_string(),
            redis_image: "redis:3.0-alpine".to_string(),
            artifact_ip: "127.0.0.1".to_string(),
            artifact_port: 5454,
            http_port: 5656,
            log_format: "text".to_string(),
            store: StoreConfig::default(),
            reconciler: ReconcilerConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// On-disk redb file at `endpoint`.
    Redb,
    /// Ephemeral in-memory redb; state is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub endpoint: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redb,
            endpoint: "/var/lib/redfleet/redfleet.redb".to_string(),
        }
    }
}

/// Tuning for the create / maintain / destroy loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub maintain_interval_ms: u64,
    pub destroy_interval_ms: u64,
    /// Launch attempts per work item before the instance is marked failed.
    pub max_launch_attempts: u32,
    /// Wait for a kill to land before re-issuing it.
    pub kill_timeout_ms: u64,
    /// Kill rounds before a deletion is forced.
    pub max_kill_attempts: u32,
    /// A task still staging after this long is killed and replaced.
    pub staging_timeout_ms: u64,
    /// Unknown tasks reported by the scheduler are killed after this long.
    pub orphan_grace_ms: u64,
    /// How long a forced-deletion tombstone stays visible.
    pub tombstone_ttl_ms: u64,
    /// CPU reserved per task.
    pub task_cpu: f64,
    /// Ports reserved per task.
    pub task_ports: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            maintain_interval_ms: 1000,
            destroy_interval_ms: 1000,
            max_launch_attempts: 5,
            kill_timeout_ms: 5000,
            max_kill_attempts: 5,
            staging_timeout_ms: 120_000,
            orphan_grace_ms: 10_000,
            tombstone_ttl_ms: 3_600_000,
            task_cpu: 1.0,
            task_ports: 1,
        }
    }
}

impl ReconcilerConfig {
    pub fn maintain_interval(&self) -> Duration {
        Duration::from_millis(self.maintain_interval_ms)
    }

    pub fn destroy_interval(&self) -> Duration {
        Duration::from_millis(self.destroy_interval_ms)
    }
}

/// The in-process simulated cluster standing in for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// How often free capacity is offered.
    pub offer_interval_ms: u64,
    /// How long an offer stays valid.
    pub offer_ttl_ms: u64,
    /// Delay between a launch and the task reporting running.
    pub task_startup_ms: u64,
    pub nodes: Vec<NodeConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            offer_interval_ms: 1000,
            offer_ttl_ms: 5000,
            task_startup_ms: 500,
            nodes: vec![NodeConfig::default()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    pub cpu: f64,
    pub memory_mb: u64,
    pub port_start: u16,
    pub port_end: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            cpu: 4.0,
            memory_mb: 4096,
            port_start: 6379,
            port_end: 6399,
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to defaults when the file does not exist.
    ///
    /// A file that exists but does not parse is an error. The flag tells
    /// the caller whether the file was found.
    pub fn load_or_default(path: &Path) -> Result<(Self, bool), ConfigError> {
        if !path.exists() {
            return Ok((Self::default(), false));
        }
        Ok((Self::from_file(path)?, true))
    }

    /// Apply [`STORE_ENDPOINT_ENV`] from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.override_store_endpoint(std::env::var(STORE_ENDPOINT_ENV).ok());
    }

    /// Replace the store endpoint if `endpoint` is set and non-empty.
    pub fn override_store_endpoint(&mut self, endpoint: Option<String>) {
        if let Some(endpoint) = endpoint.filter(|e| !e.trim().is_empty()) {
            self.store.endpoint = endpoint;
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.reconciler;
        if r.task_cpu <= 0.0 {
            return Err(ConfigError::Invalid("reconciler.task_cpu must be positive".into()));
        }
        if r.max_launch_attempts == 0 || r.max_kill_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconciler attempt ceilings must be at least 1".into(),
            ));
        }
        if r.maintain_interval_ms == 0 || r.destroy_interval_ms == 0 {
            return Err(ConfigError::Invalid("loop intervals must be non-zero".into()));
        }
        for node in &self.cluster.nodes {
            if node.port_end < node.port_start {
                return Err(ConfigError::Invalid(format!(
                    "node {}: port_end < port_start",
                    node.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.http_port, 5656);
        assert_eq!(config.store.backend, StoreBackend::Redb);
        assert_eq!(config.cluster.nodes.len(), 1);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let config = FleetConfig::from_toml_str(
            r#"
master = "10.11.12.13:5050"

[store]
backend = "memory"

[reconciler]
max_kill_attempts = 2
"#,
        )
        .unwrap();
        assert_eq!(config.master, "10.11.12.13:5050");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.endpoint, StoreConfig::default().endpoint);
        assert_eq!(config.reconciler.max_kill_attempts, 2);
        assert_eq!(config.reconciler.max_launch_attempts, 5);
    }

    #[test]
    fn dump_and_reparse() {
        let dumped = FleetConfig::default().to_toml_string().unwrap();
        assert!(dumped.contains("framework_name = \"RedFleet\""));
        let parsed = FleetConfig::from_toml_str(&dumped).unwrap();
        assert_eq!(parsed, FleetConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(matches!(
            FleetConfig::from_toml_str("http_port = \"not a number\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = FleetConfig::from_toml_str("[reconciler]\nmax_kill_attempts = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, found) =
            FleetConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(!found);
        assert_eq!(config, FleetConfig::default());
    }

    #[test]
    fn existing_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redfleet.toml");
        std::fs::write(&path, "http_port = 7000\n").unwrap();
        let (config, found) = FleetConfig::load_or_default(&path).unwrap();
        assert!(found);
        assert_eq!(config.http_port, 7000);
    }

    #[test]
    fn store_endpoint_override() {
        let mut config = FleetConfig::default();
        config.override_store_endpoint(None);
        assert_eq!(config.store.endpoint, StoreConfig::default().endpoint);

        config.override_store_endpoint(Some("  ".to_string()));
        assert_eq!(config.store.endpoint, StoreConfig::default().endpoint);

        config.override_store_endpoint(Some("/tmp/local.redb".to_string()));
        assert_eq!(config.store.endpoint, "/tmp/local.redb");
    }
}
