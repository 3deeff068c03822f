//! Write path.
//!
//! A write resolves its target client, takes that client's operation lock
//! for the whole operation, and then performs either a scalar write coerced
//! to the point's declared type, or a positional write into the designated
//! bit-array command point.
//!
//! Write failures are reported to the caller only; they never change the
//! client's connection status.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::core::data::{coerce, Value, VariantType, WriteValue};
use crate::core::error::GatewayError;
use crate::core::traits::{NodeHandle, PlcSession};
use crate::gateway::client::ClientAccess;
use crate::gateway::scheduler::ClientRegistry;

/// A single write as received from the request layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Target endpoint address.
    #[serde(alias = "plc_url")]
    pub address: String,

    /// Target point name.
    #[serde(alias = "node_name")]
    pub point_name: String,

    pub value: WriteValue,

    /// Authenticated identity issuing the write, for the audit log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl WriteRequest {
    pub fn new(address: impl Into<String>, point_name: impl Into<String>, value: WriteValue) -> Self {
        Self {
            address: address.into(),
            point_name: point_name.into(),
            value,
            actor: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Successful write acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteAck {
    pub status: &'static str,
    /// Bits written, for bit-array writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<Vec<bool>>,
}

impl WriteAck {
    fn scalar() -> Self {
        Self {
            status: "success",
            written: None,
        }
    }

    fn bits(written: Vec<bool>) -> Self {
        Self {
            status: "success",
            written: Some(written),
        }
    }
}

/// Reasons a write is refused or fails.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("endpoint {0} not found")]
    EndpointNotFound(String),

    #[error("PLC not connected: {0}")]
    NotConnected(String),

    #[error("point '{0}' not found")]
    PointNotFound(String),

    #[error("array point '{0}' not found")]
    ArrayParentNotFound(String),

    #[error("no indexed bits found under '{0}'")]
    NoIndexedBits(String),

    /// Lower-index bits before `index` were already written and are not
    /// rolled back.
    #[error("bit [{index}] not found under '{point}' ({written} bits already written)")]
    BitNotFound {
        point: String,
        index: usize,
        written: usize,
    },

    #[error("unsupported write: {0}")]
    Unsupported(String),

    #[error("cannot convert value: {0}")]
    Coercion(String),

    #[error("write failed: {0}")]
    Transport(String),
}

impl WriteError {
    /// HTTP-style status code for the request layer.
    pub fn code(&self) -> u16 {
        match self {
            Self::EndpointNotFound(_)
            | Self::NotConnected(_)
            | Self::PointNotFound(_)
            | Self::ArrayParentNotFound(_)
            | Self::NoIndexedBits(_)
            | Self::BitNotFound { .. } => 404,
            Self::Unsupported(_) | Self::Coercion(_) => 400,
            Self::Transport(_) => 500,
        }
    }
}

impl Serialize for WriteError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("WriteError", 3)?;
        s.serialize_field("status", "error")?;
        s.serialize_field("code", &self.code())?;
        s.serialize_field("reason", &self.to_string())?;
        s.end()
    }
}

fn coercion_error(e: GatewayError) -> WriteError {
    match e {
        GatewayError::Unsupported(msg) => WriteError::Unsupported(msg),
        GatewayError::InvalidValue(msg) => WriteError::Coercion(msg),
        other => WriteError::Coercion(other.to_string()),
    }
}

/// Parse a positional child label such as `[3]`.
fn bit_index(label: &str) -> Option<usize> {
    label.strip_prefix('[')?.strip_suffix(']')?.trim().parse().ok()
}

/// Serializes writes with polling on the same endpoint.
pub struct WriteCoordinator {
    registry: Arc<ClientRegistry>,
    bit_array_point: String,
}

impl WriteCoordinator {
    pub fn new(registry: Arc<ClientRegistry>, bit_array_point: impl Into<String>) -> Self {
        Self {
            registry,
            bit_array_point: bit_array_point.into(),
        }
    }

    /// Point name that accepts bit sequences.
    pub fn bit_array_point(&self) -> &str {
        &self.bit_array_point
    }

    pub async fn write(&self, req: &WriteRequest) -> Result<WriteAck, WriteError> {
        let client = self
            .registry
            .get(&req.address)
            .ok_or_else(|| WriteError::EndpointNotFound(req.address.clone()))?;
        if !client.status().is_connected() {
            return Err(WriteError::NotConnected(req.address.clone()));
        }

        let access = client.exclusive().await;
        // The client may have dropped while waiting for the lock.
        let session = access
            .session()
            .ok_or_else(|| WriteError::NotConnected(req.address.clone()))?;

        let actor = req.actor.as_deref().unwrap_or("-");
        match &req.value {
            WriteValue::Bits(bits) if req.point_name == self.bit_array_point => {
                let written = self.write_bits(&access, session.as_ref(), bits).await;
                match &written {
                    Ok(_) => info!(
                        actor,
                        endpoint = %client.name(),
                        point = %req.point_name,
                        bits = ?bits,
                        "bit-array write"
                    ),
                    Err(e) => error!(endpoint = %client.name(), point = %req.point_name, error = %e, "bit-array write failed"),
                }
                written
            }
            WriteValue::Bits(_) => Err(WriteError::Unsupported(format!(
                "array writes are only supported for '{}'",
                self.bit_array_point
            ))),
            _ => {
                let handle = access
                    .directory()
                    .get(&req.point_name)
                    .cloned()
                    .ok_or_else(|| WriteError::PointNotFound(req.point_name.clone()))?;
                let value = write_scalar(session.as_ref(), &handle, &req.value).await;
                match &value {
                    Ok(v) => info!(
                        actor,
                        endpoint = %client.name(),
                        address = %req.address,
                        point = %req.point_name,
                        value = ?v,
                        "write"
                    ),
                    Err(e) => error!(endpoint = %client.name(), point = %req.point_name, error = %e, "write failed"),
                }
                value.map(|_| WriteAck::scalar())
            }
        }
    }

    async fn write_bits(
        &self,
        access: &ClientAccess<'_>,
        session: &dyn PlcSession,
        bits: &[bool],
    ) -> Result<WriteAck, WriteError> {
        let point = &self.bit_array_point;
        let parent = access
            .directory()
            .get(point)
            .ok_or_else(|| WriteError::ArrayParentNotFound(point.clone()))?;

        let children = session
            .children(parent)
            .await
            .map_err(|e| WriteError::Transport(format!("cannot resolve bits of '{}': {}", point, e)))?;

        let index: BTreeMap<usize, NodeHandle> = children
            .into_iter()
            .filter_map(|child| bit_index(&child.browse_name).map(|i| (i, child.handle)))
            .collect();
        if index.is_empty() {
            return Err(WriteError::NoIndexedBits(point.clone()));
        }

        for (i, &bit) in bits.iter().enumerate() {
            let handle = index.get(&i).ok_or_else(|| WriteError::BitNotFound {
                point: point.clone(),
                index: i,
                written: i,
            })?;
            session
                .write_value(handle, Value::Bool(bit), VariantType::Boolean)
                .await
                .map_err(|e| WriteError::Transport(format!("bit [{}]: {}", i, e)))?;
            debug!(%point, index = i, bit, "bit written");
        }

        Ok(WriteAck::bits(bits.to_vec()))
    }
}

async fn write_scalar(
    session: &dyn PlcSession,
    handle: &NodeHandle,
    value: &WriteValue,
) -> Result<Value, WriteError> {
    let ty = session
        .data_type(handle)
        .await
        .map_err(|e| WriteError::Transport(format!("cannot read data type: {}", e)))?;
    let coerced = coerce(value, ty).map_err(coercion_error)?;

    if let Ok(before) = session.read_value(handle).await {
        debug!(node = %handle, ?before, %ty, "value before write");
    }

    session
        .write_value(handle, coerced.clone(), ty)
        .await
        .map_err(|e| WriteError::Transport(e.to_string()))?;

    if let Ok(after) = session.read_value(handle).await {
        debug!(node = %handle, ?after, "value after write");
    }
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::core::timeout::Timeouts;
    use crate::core::traits::{ConnectionState, PlcConnector};
    use crate::gateway::client::EndpointClient;
    use crate::gateway::config::EndpointDescriptor;
    use crate::protocols::virtual_plc::{Fault, Operation, VirtualConnector, VirtualPlc};

    const ADDR: &str = "opc.tcp://sim:4840";
    const CUTOFF: &str = "CMD_Instant_Cutoff";

    async fn setup() -> (WriteCoordinator, Arc<EndpointClient>, VirtualPlc) {
        let connector = VirtualConnector::demo([ADDR], "root");
        let plc = connector.plc(ADDR).unwrap();
        let shared: Arc<dyn PlcConnector> = Arc::new(connector);
        let client = Arc::new(EndpointClient::new(
            EndpointDescriptor::new(ADDR, "Park", "root"),
            shared,
            Timeouts::default(),
        ));
        client.connect_and_discover().await.unwrap();

        let registry = Arc::new(ClientRegistry::new(vec![client.clone()]));
        (WriteCoordinator::new(registry, CUTOFF), client, plc)
    }

    fn bits(v: &[bool]) -> WriteValue {
        WriteValue::Bits(v.to_vec())
    }

    #[test]
    fn test_bit_index() {
        assert_eq!(bit_index("[0]"), Some(0));
        assert_eq!(bit_index("[12]"), Some(12));
        assert_eq!(bit_index("0"), None);
        assert_eq!(bit_index("[x]"), None);
    }

    #[tokio::test]
    async fn test_bit_array_written_in_order() {
        let (writer, _client, plc) = setup().await;
        let ack = writer
            .write(&WriteRequest::new(ADDR, CUTOFF, bits(&[true, false])))
            .await
            .unwrap();
        assert_eq!(ack.written, Some(vec![true, false]));

        let journal = plc.journal();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].0.as_str(), "ns=2;s=Plc1.Cutoff[0]");
        assert_eq!(journal[0].1, Value::Bool(true));
        assert_eq!(journal[1].0.as_str(), "ns=2;s=Plc1.Cutoff[1]");
        assert_eq!(journal[1].1, Value::Bool(false));
    }

    #[tokio::test]
    async fn test_bit_array_missing_index_fails_after_partial_write() {
        let (writer, _client, plc) = setup().await;
        let err = writer
            .write(&WriteRequest::new(ADDR, CUTOFF, bits(&[true, true, true])))
            .await
            .unwrap_err();

        match err {
            WriteError::BitNotFound { index, written, .. } => {
                assert_eq!(index, 2);
                assert_eq!(written, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(plc.journal().len(), 2);
    }

    #[tokio::test]
    async fn test_bits_rejected_for_other_points() {
        let (writer, _client, _plc) = setup().await;
        let err = writer
            .write(&WriteRequest::new(ADDR, "Setpoint", bits(&[true])))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Unsupported(_)));
        assert_eq!(err.code(), 400);
    }

    #[tokio::test]
    async fn test_array_parent_without_bits() {
        let (writer, client, plc) = setup().await;
        plc.remove("ns=2;s=Plc1.Cutoff[0]");
        plc.remove("ns=2;s=Plc1.Cutoff[1]");
        client.connect_and_discover().await.unwrap();

        let err = writer
            .write(&WriteRequest::new(ADDR, CUTOFF, bits(&[true])))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::NoIndexedBits(_)));
    }

    #[tokio::test]
    async fn test_scalar_write_is_coerced() {
        let (writer, _client, plc) = setup().await;
        let ack = writer
            .write(&WriteRequest::new(ADDR, "Setpoint", WriteValue::Float(42.9)).with_actor("ops@example.com"))
            .await
            .unwrap();
        assert_eq!(ack.status, "success");
        assert!(ack.written.is_none());
        assert_eq!(plc.value("ns=2;s=Plc1.Setpoint"), Some(Value::Integer(42)));

        writer
            .write(&WriteRequest::new(ADDR, "Power", WriteValue::Integer(7)))
            .await
            .unwrap();
        assert_eq!(plc.value("ns=2;s=Plc1.Power"), Some(Value::Float(7.0)));
    }

    #[tokio::test]
    async fn test_coercion_failure_is_400() {
        let (writer, _client, _plc) = setup().await;
        let err = writer
            .write(&WriteRequest::new(ADDR, "Setpoint", WriteValue::Text("fast".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Coercion(_)));
        assert_eq!(err.code(), 400);
    }

    #[tokio::test]
    async fn test_resolution_failures() {
        let (writer, client, _plc) = setup().await;

        let err = writer
            .write(&WriteRequest::new("opc.tcp://other:4840", "Setpoint", WriteValue::Integer(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::EndpointNotFound(_)));

        let err = writer
            .write(&WriteRequest::new(ADDR, "Nope", WriteValue::Integer(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::PointNotFound(_)));
        assert_eq!(err.code(), 404);

        client.disconnect_safe();
        let err = writer
            .write(&WriteRequest::new(ADDR, "Setpoint", WriteValue::Integer(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_write_failure_keeps_connection_status() {
        let (writer, client, plc) = setup().await;
        plc.set_fault(Operation::Write, Fault::Status("BadUserAccessDenied".into()));

        let err = writer
            .write(&WriteRequest::new(ADDR, "Setpoint", WriteValue::Integer(5)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 500);
        assert_eq!(client.status(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_write_and_read_never_overlap() {
        let (writer, client, plc) = setup().await;
        plc.set_fault(Operation::Read, Fault::Delay(Duration::from_millis(30)));
        plc.set_fault(Operation::Write, Fault::Delay(Duration::from_millis(30)));

        let writer = Arc::new(writer);
        let mut tasks = Vec::new();
        for i in 0..4 {
            let reader = client.clone();
            tasks.push(tokio::spawn(async move {
                reader.read_data().await;
            }));
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                writer
                    .write(&WriteRequest::new(ADDR, "Setpoint", WriteValue::Integer(i)))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(plc.max_concurrent_ops(), 1);
    }

    #[test]
    fn test_error_serialization() {
        let err = WriteError::BitNotFound {
            point: CUTOFF.into(),
            index: 2,
            written: 2,
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["code"], 404);
        assert!(json["reason"].as_str().unwrap().contains("[2]"));
    }

    #[test]
    fn test_request_accepts_legacy_field_names() {
        let req: WriteRequest = serde_json::from_str(
            r#"{"plc_url":"opc.tcp://a:4840","node_name":"CMD_Instant_Cutoff","value":[true,false]}"#,
        )
        .unwrap();
        assert_eq!(req.address, "opc.tcp://a:4840");
        assert_eq!(req.value, WriteValue::Bits(vec![true, false]));
    }
}
