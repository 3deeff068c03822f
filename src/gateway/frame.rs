//! Telemetry snapshots and the wire frame pushed to viewers.
//!
//! Wire shape:
//!
//! ```json
//! {"type":"telemetry_update","data":{"plc_clients":[
//!   {"name":"Park North","url":"opc.tcp://...","status":"CONNECTED",
//!    "nodes":[{"name":"Power","value":12.5}]}
//! ]}}
//! ```

use serde::{Deserialize, Serialize};

use crate::core::data::Value;
use crate::core::error::{GatewayError, Result};
use crate::core::traits::ConnectionState;

/// One point value in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReading {
    pub name: String,
    pub value: Value,
}

impl NodeReading {
    /// Build a reading; non-finite numbers become `null`.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value: value.sanitized(),
        }
    }
}

/// One endpoint's read result for one tick. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub name: String,
    #[serde(rename = "url")]
    pub address: String,
    pub status: ConnectionState,
    #[serde(default)]
    pub nodes: Vec<NodeReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TelemetrySnapshot {
    /// A snapshot carrying only identity and status.
    pub fn status_only(
        name: impl Into<String>,
        address: impl Into<String>,
        status: ConnectionState,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            status,
            nodes: Vec::new(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeReading>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Value of a point by name.
    pub fn value(&self, point: &str) -> Option<&Value> {
        self.nodes.iter().find(|n| n.name == point).map(|n| &n.value)
    }
}

/// Payload of a telemetry update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub plc_clients: Vec<TelemetrySnapshot>,
}

/// Frame pushed to subscriber sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryFrame {
    TelemetryUpdate { data: TelemetryPayload },
}

impl TelemetryFrame {
    pub fn from_snapshots(snapshots: Vec<TelemetrySnapshot>) -> Self {
        Self::TelemetryUpdate {
            data: TelemetryPayload {
                plc_clients: snapshots,
            },
        }
    }

    pub fn snapshots(&self) -> &[TelemetrySnapshot] {
        match self {
            Self::TelemetryUpdate { data } => &data.plc_clients,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| GatewayError::Internal(format!("frame encoding failed: {}", e)))
    }
}
