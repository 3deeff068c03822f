//! Error types for the gateway.
//!
//! Connection-level failures are absorbed by the endpoint clients and only
//! surface as a [`ConnectionState`](crate::core::traits::ConnectionState);
//! everything else propagates as a [`GatewayError`].

use std::time::Duration;

use thiserror::Error;

/// Operation phase guarded by a hard deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Session establishment.
    Connect,
    /// Server identity read after connect.
    Metadata,
    /// Recursive point discovery under the root node.
    Discovery,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Metadata => "metadata",
            Self::Discovery => "discovery",
        };
        write!(f, "{}", s)
    }
}

/// Errors produced by the gateway core and its protocol adapters.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to establish a session with a controller.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation requires a connected session.
    #[error("not connected")]
    NotConnected,

    /// Generic protocol failure (browse, metadata, encoding).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The controller answered with a protocol-level bad status.
    ///
    /// On a read this demotes the client to `Error`.
    #[error("status error: {0}")]
    Status(String),

    /// Transient transport failure; the session is assumed still usable.
    #[error("transport error: {0}")]
    Transport(String),

    /// A guarded phase exceeded its deadline.
    #[error("{phase} timed out after {after:?}")]
    Timeout {
        /// Phase that was abandoned.
        phase: Phase,
        /// Configured deadline.
        after: Duration,
    },

    /// Operation is not supported for this target.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Value cannot be represented as requested.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Internal failure (task panic, poisoned state).
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O failure (configuration file access).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Shorthand for [`GatewayError::InvalidValue`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    /// Whether this error came from a guarded phase running out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this is a protocol-level status error.
    pub fn is_status(&self) -> bool {
        matches!(self, Self::Status(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
