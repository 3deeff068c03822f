//! Gateway configuration.
//!
//! Loaded from TOML. Every field except the endpoint list has a default.
//!
//! ```toml
//! [gateway]
//! name = "Wind Parks"
//! poll_interval_ms = 1000
//! reconnect_backoff_secs = 300
//! common_root_node = "ns=3;s=\"DB_SCADA\""
//!
//! [gateway.timeouts]
//! connect_ms = 10000
//!
//! [[endpoints]]
//! address = "opc.tcp://10.0.0.10:4840"
//! name = "Park North"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};
use crate::core::timeout::Timeouts;

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub opcua: OpcUaSettings,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Display name for logs.
    #[serde(default = "default_name")]
    pub name: String,

    /// Tick interval of the poller.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Minimum time between reconnect attempts for a failed endpoint.
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,

    /// Discovery root used by endpoints that do not set `root_node`.
    #[serde(default)]
    pub common_root_node: Option<String>,

    /// Point name that accepts positional bit-array writes.
    #[serde(default = "default_bit_array_point")]
    pub bit_array_point: String,

    /// Worker pool size (default: twice the endpoint count, at least 2).
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Pause after a failed tick before the loop retries.
    #[serde(default = "default_error_cooldown_ms")]
    pub error_cooldown_ms: u64,

    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            poll_interval_ms: default_poll_interval_ms(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            common_root_node: None,
            bit_array_point: default_bit_array_point(),
            worker_threads: None,
            error_cooldown_ms: default_error_cooldown_ms(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

/// Per-phase I/O deadlines in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    #[serde(default = "default_metadata_ms")]
    pub metadata_ms: u64,

    #[serde(default = "default_discovery_ms")]
    pub discovery_ms: u64,

    /// Upper bound on waiting for the poller during shutdown.
    #[serde(default = "default_shutdown_ms")]
    pub shutdown_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            metadata_ms: default_metadata_ms(),
            discovery_ms: default_discovery_ms(),
            shutdown_ms: default_shutdown_ms(),
        }
    }
}

impl TimeoutSettings {
    /// Guard deadlines for the connect phases.
    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_ms),
            metadata: Duration::from_millis(self.metadata_ms),
            discovery: Duration::from_millis(self.discovery_ms),
        }
    }
}

/// OPC UA client identity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaSettings {
    #[serde(default = "default_app_name")]
    pub application_name: String,

    #[serde(default = "default_app_uri")]
    pub application_uri: String,

    /// Automatically trust server certificates.
    #[serde(default = "default_trust_certs")]
    pub trust_server_certs: bool,

    #[serde(default = "default_session_retry_limit")]
    pub session_retry_limit: u32,

    /// PKI directory for the client certificate store.
    #[serde(default)]
    pub pki_dir: Option<String>,
}

impl Default for OpcUaSettings {
    fn default() -> Self {
        Self {
            application_name: default_app_name(),
            application_uri: default_app_uri(),
            trust_server_certs: default_trust_certs(),
            session_retry_limit: default_session_retry_limit(),
            pki_dir: None,
        }
    }
}

/// One controller as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Connection URL (`opc.tcp://host:port`).
    pub address: String,

    /// Display name.
    pub name: String,

    /// Discovery root; falls back to `gateway.common_root_node`.
    #[serde(default)]
    pub root_node: Option<String>,
}

/// Resolved endpoint identity handed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: String,
    pub name: String,
    pub root_node: String,
}

impl EndpointDescriptor {
    pub fn new(
        address: impl Into<String>,
        name: impl Into<String>,
        root_node: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            root_node: root_node.into(),
        }
    }
}

fn default_name() -> String {
    "SCADA Gateway".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_reconnect_backoff_secs() -> u64 {
    300
}

fn default_bit_array_point() -> String {
    "CMD_Instant_Cutoff".to_string()
}

fn default_error_cooldown_ms() -> u64 {
    5000
}

fn default_connect_ms() -> u64 {
    10_000
}

fn default_metadata_ms() -> u64 {
    5_000
}

fn default_discovery_ms() -> u64 {
    30_000
}

fn default_shutdown_ms() -> u64 {
    2_000
}

fn default_app_name() -> String {
    "SCADA Gateway OPC UA Client".to_string()
}

fn default_app_uri() -> String {
    "urn:scada-gateway:opcua:client".to_string()
}

fn default_trust_certs() -> bool {
    true
}

fn default_session_retry_limit() -> u32 {
    3
}

impl GatewayConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations the runtime cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(GatewayError::Config("no endpoints configured".into()));
        }
        if self.gateway.poll_interval_ms == 0 {
            return Err(GatewayError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.gateway.worker_threads == Some(0) {
            return Err(GatewayError::Config("worker_threads must be > 0".into()));
        }

        let mut seen = HashSet::with_capacity(self.endpoints.len());
        for ep in &self.endpoints {
            if ep.address.trim().is_empty() {
                return Err(GatewayError::Config(format!(
                    "endpoint '{}' has an empty address",
                    ep.name
                )));
            }
            if !seen.insert(ep.address.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate endpoint address: {}",
                    ep.address
                )));
            }
            if ep.root_node.is_none() && self.gateway.common_root_node.is_none() {
                return Err(GatewayError::Config(format!(
                    "endpoint '{}' has no root_node and no common_root_node is set",
                    ep.name
                )));
            }
        }
        Ok(())
    }

    /// Endpoint descriptors in configuration order.
    pub fn descriptors(&self) -> Vec<EndpointDescriptor> {
        let common = self.gateway.common_root_node.clone().unwrap_or_default();
        self.endpoints
            .iter()
            .map(|ep| EndpointDescriptor {
                address: ep.address.clone(),
                name: ep.name.clone(),
                root_node: ep.root_node.clone().unwrap_or_else(|| common.clone()),
            })
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.gateway.poll_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.gateway.reconnect_backoff_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.gateway.error_cooldown_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.timeouts.shutdown_ms)
    }

    /// Worker pool size for connect/read dispatch.
    pub fn worker_count(&self) -> usize {
        self.gateway
            .worker_threads
            .unwrap_or_else(|| (self.endpoints.len() * 2).max(2))
    }
}

/// Sample configuration printed by `scada-gateway example`.
pub const EXAMPLE_CONFIG: &str = r#"# SCADA Gateway configuration

[gateway]
name = "Wind Parks"
poll_interval_ms = 1000
reconnect_backoff_secs = 300
common_root_node = "ns=3;s=\"DB_SCADA\""
bit_array_point = "CMD_Instant_Cutoff"

[gateway.timeouts]
connect_ms = 10000
metadata_ms = 5000
discovery_ms = 30000
shutdown_ms = 2000

[opcua]
application_name = "SCADA Gateway OPC UA Client"
trust_server_certs = true

[[endpoints]]
address = "opc.tcp://192.168.1.10:4840"
name = "Park North"

[[endpoints]]
address = "opc.tcp://192.168.1.20:4840"
name = "Park South"
root_node = "ns=3;s=\"DB_SCADA_SOUTH\""
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_is_valid() {
        let config = GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(300));
        assert_eq!(config.worker_count(), 4);

        let descriptors = config.descriptors();
        assert_eq!(descriptors[0].root_node, "ns=3;s=\"DB_SCADA\"");
        assert_eq!(descriptors[1].root_node, "ns=3;s=\"DB_SCADA_SOUTH\"");
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [[endpoints]]
            address = "opc.tcp://a:4840"
            name = "A"
            root_node = "ns=2;s=Root"
            "#,
        )
        .unwrap();

        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.gateway.bit_array_point, "CMD_Instant_Cutoff");
        assert_eq!(config.worker_count(), 2);
        let t = config.gateway.timeouts.to_timeouts();
        assert_eq!(t.connect, Duration::from_secs(10));
        assert_eq!(t.discovery, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_duplicate_address() {
        let err = GatewayConfig::from_toml_str(
            r#"
            [gateway]
            common_root_node = "r"
            [[endpoints]]
            address = "opc.tcp://a:4840"
            name = "A"
            [[endpoints]]
            address = "opc.tcp://a:4840"
            name = "B"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_missing_root() {
        let err = GatewayConfig::from_toml_str(
            r#"
            [[endpoints]]
            address = "opc.tcp://a:4840"
            name = "A"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(GatewayConfig::from_toml_str("").is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = GatewayConfig::load("/nonexistent/scada-gateway.toml").unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
    }
}
