//! Core abstractions for the gateway.
//!
//! This module provides the foundational types and traits shared by the
//! runtime and every protocol adapter.

pub mod data;
pub mod error;
pub mod logging;
pub mod timeout;
pub mod traits;

pub use data::*;
pub use error::{GatewayError, Phase, Result};
pub use timeout::Timeouts;
pub use traits::*;
