//! Core traits for protocol implementations.
//!
//! The gateway runtime never talks to a protocol stack directly. It goes
//! through two seams:
//!
//! ```text
//! PlcConnector   // opens a session against one endpoint address
//! └── PlcSession // browse, read, write and fast close on that session
//! ```
//!
//! Both traits use `async_trait` because the runtime holds them as
//! `Arc<dyn ...>` and moves them into guarded tasks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::data::{Value, VariantType};
use crate::core::error::Result;

/// Connection state of an endpoint client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected to the target.
    #[default]
    Disconnected,

    /// Connect/discovery in progress.
    Connecting,

    /// Connected and operational.
    Connected,

    /// Read or discovery failure; eligible for reconnect.
    Error,
}

impl ConnectionState {
    /// Check if currently connected.
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if retry is possible.
    #[inline]
    pub const fn can_retry(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// Wire label.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque protocol node identifier (e.g. `ns=2;s=Line1.Speed`).
///
/// Handles are only meaningful for the session that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(String);

impl NodeHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Class of a node in the controller's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeClass {
    Object,
    Variable,
    Method,
    /// Types, views and anything else that is never read as a point.
    Other,
}

/// A browsed node: handle plus the attributes discovery needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub handle: NodeHandle,
    /// Leaf browse name (e.g. `Speed`, `[0]`).
    pub browse_name: String,
    pub class: NodeClass,
}

impl NodeRef {
    pub fn new(handle: impl Into<NodeHandle>, browse_name: impl Into<String>, class: NodeClass) -> Self {
        Self {
            handle: handle.into(),
            browse_name: browse_name.into(),
            class,
        }
    }

    /// Whether this node is itself a readable variable.
    #[inline]
    pub fn is_variable(&self) -> bool {
        self.class == NodeClass::Variable
    }
}

/// Opens sessions against controller endpoints.
#[async_trait]
pub trait PlcConnector: Send + Sync {
    /// Protocol name for logs.
    fn protocol(&self) -> &'static str;

    /// Establish a session with the endpoint at `address`.
    ///
    /// May block on network I/O for as long as the underlying stack allows;
    /// callers bound it with the timeout guard.
    async fn connect(&self, address: &str) -> Result<Arc<dyn PlcSession>>;
}

/// One live session against a controller.
#[async_trait]
pub trait PlcSession: Send + Sync {
    /// Read the server identity (product/application name).
    async fn server_name(&self) -> Result<String>;

    /// Resolve a node's browse name and class.
    async fn describe(&self, node: &NodeHandle) -> Result<NodeRef>;

    /// List the hierarchical children of a node.
    async fn children(&self, node: &NodeHandle) -> Result<Vec<NodeRef>>;

    /// Read the current value of every handle in one round trip.
    ///
    /// The result has the same length and order as `nodes`. A protocol-level
    /// bad status is reported as `GatewayError::Status`; any other error is
    /// treated as transient by the caller.
    async fn read_values(&self, nodes: &[NodeHandle]) -> Result<Vec<Value>>;

    /// Read a single value.
    async fn read_value(&self, node: &NodeHandle) -> Result<Value> {
        let mut values = self.read_values(std::slice::from_ref(node)).await?;
        Ok(values.pop().unwrap_or_default())
    }

    /// Declared data type of a variable node.
    async fn data_type(&self, node: &NodeHandle) -> Result<VariantType>;

    /// Write an already coerced value as `ty`.
    async fn write_value(&self, node: &NodeHandle, value: Value, ty: VariantType) -> Result<()>;

    /// Drop the underlying transport without the protocol close handshake.
    ///
    /// Must not block and must not fail; errors are ignored.
    fn close_transport(&self);
}
