//! Protocol implementations.
//!
//! Each adapter implements the [`PlcConnector`](crate::core::traits::PlcConnector)
//! and [`PlcSession`](crate::core::traits::PlcSession) seam.

pub mod virtual_plc;

#[cfg(feature = "opcua")]
#[cfg_attr(docsrs, doc(cfg(feature = "opcua")))]
pub mod opcua;
