//! # SCADA Gateway
//!
//! Keeps live sessions to a fleet of PLCs, polls their points on a fixed
//! cadence and fans the results out to viewer sessions, each filtered to the
//! endpoints that viewer may see. Point writes go back to the controllers
//! under the same per-endpoint lock the poller uses.
//!
//! ## Layout
//!
//! - [`core`]: values, types, errors, the transport seam and the timeout guard
//! - [`gateway`]: endpoint clients, scheduler, broadcast hub, write path
//! - [`protocols`]: OPC UA (feature `opcua`) and an in-memory virtual PLC
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use scada_gateway::prelude::*;
//! use scada_gateway::protocols::opcua::OpcUaConnector;
//!
//! let config = GatewayConfig::load("gateway.toml")?;
//! let connector = Arc::new(OpcUaConnector::new(config.opcua.clone()));
//! let gateway = Gateway::new(config, connector)?;
//! gateway.start();
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//! gateway.subscribe("operator", Visibility::All, tx).await;
//! while let Some(frame) = rx.recv().await {
//!     println!("{frame}");
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;
pub mod gateway;
pub mod protocols;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        data::*,
        error::{GatewayError, Phase, Result},
        traits::*,
    };
    pub use crate::gateway::{
        EndpointSummary, Gateway, GatewayConfig, SessionId, TelemetryFrame, TelemetrySnapshot,
        Visibility, WriteAck, WriteError, WriteRequest,
    };
}

// Re-export core types at crate root for convenience
pub use crate::core::error::{GatewayError, Result};
pub use crate::core::data::{Value, VariantType, WriteValue};
pub use crate::core::traits::{ConnectionState, PlcConnector, PlcSession};
pub use crate::gateway::{Gateway, GatewayConfig};
