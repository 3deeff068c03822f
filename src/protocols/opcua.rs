//! OPC UA transport built on `async-opcua`.
//!
//! Implements the gateway's connector/session seam:
//!
//! - connect: anonymous session, no message security, matching endpoint.
//! - browse: forward hierarchical references, continuation points followed.
//! - server identity: first entry of `Server.ServerArray` (`ns=0;i=2254`).
//! - declared type: the `DataType` attribute, mapped from the namespace-0
//!   builtin type ids.
//! - fast close: abort the session event loop task, which owns the socket,
//!   instead of the `CloseSession` handshake.
//!
//! # Example
//!
//! ```rust,ignore
//! use scada_gateway::gateway::config::OpcUaSettings;
//! use scada_gateway::protocols::opcua::OpcUaConnector;
//!
//! let connector = OpcUaConnector::new(OpcUaSettings::default());
//! let session = connector.connect("opc.tcp://192.168.1.10:4840").await?;
//! println!("{}", session.server_name().await?);
//! ```

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use opcua::client::{ClientBuilder, IdentityToken, Session};
use opcua::crypto::SecurityPolicy;
use opcua::types::{
    AttributeId, BrowseDescription, BrowseDirection, BrowseResultMask, ByteString, DataValue,
    Identifier, MessageSecurityMode, NodeId, ReadValueId, ReferenceDescription, ReferenceTypeId,
    StatusCode, TimestampsToReturn, UAString, UserTokenPolicy, Variant, WriteValue,
};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::data::{Value, VariantType};
use crate::core::error::{GatewayError, Result};
use crate::core::traits::{NodeClass, NodeHandle, NodeRef, PlcConnector, PlcSession};
use crate::gateway::config::OpcUaSettings;

/// `Server_ServerArray`.
const SERVER_ARRAY: u32 = 2254;

/// Opens OPC UA sessions.
#[derive(Debug, Clone)]
pub struct OpcUaConnector {
    settings: OpcUaSettings,
}

impl OpcUaConnector {
    pub fn new(settings: OpcUaSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PlcConnector for OpcUaConnector {
    fn protocol(&self) -> &'static str {
        "opcua"
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn PlcSession>> {
        let mut builder = ClientBuilder::new()
            .application_name(&self.settings.application_name)
            .application_uri(&self.settings.application_uri)
            .session_retry_limit(self.settings.session_retry_limit as i32)
            .create_sample_keypair(true);

        if self.settings.trust_server_certs {
            builder = builder.trust_server_certs(true);
        }
        if let Some(pki_dir) = &self.settings.pki_dir {
            builder = builder.pki_dir(pki_dir);
        }

        let mut client = builder
            .client()
            .map_err(|e| GatewayError::Config(e.join(", ")))?;

        let (session, event_loop) = client
            .connect_to_matching_endpoint(
                (
                    address,
                    SecurityPolicy::None.to_uri(),
                    MessageSecurityMode::None,
                    UserTokenPolicy::anonymous(),
                ),
                IdentityToken::Anonymous,
            )
            .await
            .map_err(|e| GatewayError::Connection(format!("{}: {}", address, e)))?;

        // Owned before waiting so a cancelled connect also stops the loop.
        let event_loop = EventLoop::new(event_loop.spawn());
        if !session.wait_for_connection().await {
            return Err(GatewayError::Connection(format!(
                "{}: session could not be established",
                address
            )));
        }
        debug!(%address, "opc ua session established");

        Ok(Arc::new(OpcUaSession {
            session,
            event_loop,
        }))
    }
}

/// Session event loop task; aborted on close or drop.
struct EventLoop {
    handle: Mutex<Option<JoinHandle<StatusCode>>>,
}

impl EventLoop {
    fn new(handle: JoinHandle<StatusCode>) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    fn abort(&self) -> bool {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A live OPC UA session.
pub struct OpcUaSession {
    session: Arc<Session>,
    event_loop: EventLoop,
}

impl OpcUaSession {
    async fn read_attribute(&self, node: &NodeId, attribute: AttributeId) -> Result<Option<Variant>> {
        let request = [ReadValueId {
            attribute_id: attribute as u32,
            ..ReadValueId::new_value(node.clone())
        }];
        let mut values = self
            .session
            .read(&request, TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(classify)?;
        let dv = values
            .pop()
            .ok_or_else(|| GatewayError::Protocol(format!("empty read result for {}", node)))?;
        check_value_status(&dv, node)?;
        Ok(dv.value)
    }

    async fn browse_children(&self, node: &NodeId) -> Result<Vec<ReferenceDescription>> {
        let description = BrowseDescription {
            node_id: node.clone(),
            browse_direction: BrowseDirection::Forward,
            reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
            include_subtypes: true,
            node_class_mask: 0,
            result_mask: BrowseResultMask::All as u32,
        };

        let mut results = self
            .session
            .browse(&[description], 0, None)
            .await
            .map_err(classify)?;
        let mut result = results
            .pop()
            .ok_or_else(|| GatewayError::Protocol(format!("empty browse result for {}", node)))?;

        let mut references = Vec::new();
        loop {
            if result.status_code.is_bad() {
                return Err(classify(result.status_code));
            }
            references.extend(result.references.take().unwrap_or_default());

            let continuation: ByteString = result.continuation_point.clone();
            if continuation.value.as_ref().map_or(true, |v| v.is_empty()) {
                break;
            }
            let mut next = self
                .session
                .browse_next(false, &[continuation])
                .await
                .map_err(classify)?;
            result = match next.pop() {
                Some(r) => r,
                None => break,
            };
        }
        Ok(references)
    }
}

#[async_trait]
impl PlcSession for OpcUaSession {
    async fn server_name(&self) -> Result<String> {
        let node = NodeId::new(0, SERVER_ARRAY);
        match self.read_attribute(&node, AttributeId::Value).await? {
            Some(Variant::Array(array)) => array
                .values
                .iter()
                .find_map(|v| match v {
                    Variant::String(s) if !s.is_null() => Some(s.as_ref().to_string()),
                    _ => None,
                })
                .ok_or_else(|| GatewayError::Protocol("server array is empty".into())),
            Some(Variant::String(s)) => Ok(s.as_ref().to_string()),
            other => Err(GatewayError::Protocol(format!(
                "unexpected server array value: {:?}",
                other
            ))),
        }
    }

    async fn describe(&self, node: &NodeHandle) -> Result<NodeRef> {
        let id = parse_node_id(node)?;
        let browse_name = match self.read_attribute(&id, AttributeId::BrowseName).await? {
            Some(Variant::QualifiedName(q)) => q.name.as_ref().to_string(),
            _ => node.to_string(),
        };
        let class = match self.read_attribute(&id, AttributeId::NodeClass).await? {
            Some(Variant::Int32(v)) => node_class_from_i32(v),
            _ => NodeClass::Other,
        };
        Ok(NodeRef::new(node.clone(), browse_name, class))
    }

    async fn children(&self, node: &NodeHandle) -> Result<Vec<NodeRef>> {
        let id = parse_node_id(node)?;
        let references = self.browse_children(&id).await?;
        Ok(references
            .into_iter()
            .map(|r| {
                NodeRef::new(
                    r.node_id.node_id.to_string(),
                    r.browse_name.name.as_ref().to_string(),
                    node_class_from_i32(r.node_class as i32),
                )
            })
            .collect())
    }

    async fn read_values(&self, nodes: &[NodeHandle]) -> Result<Vec<Value>> {
        let request = nodes
            .iter()
            .map(|h| parse_node_id(h).map(ReadValueId::new_value))
            .collect::<Result<Vec<_>>>()?;
        let values = self
            .session
            .read(&request, TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(classify)?;

        Ok(values
            .iter()
            .map(|dv| {
                dv.value
                    .as_ref()
                    .map(convert_variant_to_value)
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn data_type(&self, node: &NodeHandle) -> Result<VariantType> {
        let id = parse_node_id(node)?;
        match self.read_attribute(&id, AttributeId::DataType).await? {
            Some(Variant::NodeId(type_id)) => match (&type_id.namespace, &type_id.identifier) {
                (0, Identifier::Numeric(n)) => Ok(VariantType::from_builtin_id(*n)),
                _ => Ok(VariantType::Other(0)),
            },
            _ => Ok(VariantType::Other(0)),
        }
    }

    async fn write_value(&self, node: &NodeHandle, value: Value, ty: VariantType) -> Result<()> {
        let write = WriteValue {
            node_id: parse_node_id(node)?,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            value: DataValue::new_now(to_variant(value, ty)?),
        };

        let statuses = self.session.write(&[write]).await.map_err(classify)?;
        match statuses.first() {
            Some(code) if code.is_good() => Ok(()),
            Some(code) => Err(classify(*code)),
            None => Err(GatewayError::Protocol(format!("empty write result for {}", node))),
        }
    }

    fn close_transport(&self) {
        if self.event_loop.abort() {
            debug!("opc ua event loop aborted");
        }
    }
}

/// Transient request failures vs. protocol status errors.
fn classify(code: StatusCode) -> GatewayError {
    if code == StatusCode::BadTimeout
        || code == StatusCode::BadRequestTimeout
        || code == StatusCode::BadCommunicationError
    {
        GatewayError::Transport(code.to_string())
    } else {
        GatewayError::Status(code.to_string())
    }
}

fn check_value_status(dv: &DataValue, node: &NodeId) -> Result<()> {
    match dv.status {
        Some(code) if code.is_bad() => Err(GatewayError::Status(format!("{}: {}", node, code))),
        _ => Ok(()),
    }
}

/// Parse the string form of a node id (`ns=2;s=Motor.Speed`, `i=2254`).
fn parse_node_id(handle: &NodeHandle) -> Result<NodeId> {
    NodeId::from_str(handle.as_str())
        .map_err(|_| GatewayError::Protocol(format!("invalid node id: {}", handle)))
}

fn node_class_from_i32(v: i32) -> NodeClass {
    match v {
        1 => NodeClass::Object,
        2 => NodeClass::Variable,
        4 => NodeClass::Method,
        _ => NodeClass::Other,
    }
}

/// Convert an OPC UA variant to a gateway value.
///
/// Only `Empty` becomes null. Types with no numeric form, and `UInt64`
/// values past `i64::MAX`, are carried as their text.
fn convert_variant_to_value(variant: &Variant) -> Value {
    match variant {
        Variant::Boolean(v) => Value::Bool(*v),
        Variant::SByte(v) => Value::Integer(*v as i64),
        Variant::Byte(v) => Value::Integer(*v as i64),
        Variant::Int16(v) => Value::Integer(*v as i64),
        Variant::UInt16(v) => Value::Integer(*v as i64),
        Variant::Int32(v) => Value::Integer(*v as i64),
        Variant::UInt32(v) => Value::Integer(*v as i64),
        Variant::Int64(v) => Value::Integer(*v),
        Variant::UInt64(v) => match i64::try_from(*v) {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::String(v.to_string()),
        },
        Variant::Float(v) => Value::Float(*v as f64),
        Variant::Double(v) => Value::Float(*v),
        Variant::String(v) => Value::String(v.as_ref().to_string()),
        Variant::Array(array) => {
            Value::Array(array.values.iter().map(convert_variant_to_value).collect())
        }
        Variant::Empty => Value::Null,
        other => Value::String(other.to_string()),
    }
}

/// Encode a coerced value as the variant for the declared type.
fn to_variant(value: Value, ty: VariantType) -> Result<Variant> {
    let mismatch = |value: &Value| {
        GatewayError::invalid(format!("{:?} cannot be encoded as {}", value, ty))
    };

    Ok(match (ty, &value) {
        (VariantType::Boolean, Value::Bool(b)) => Variant::Boolean(*b),
        (VariantType::SByte, Value::Integer(i)) => Variant::SByte(*i as i8),
        (VariantType::Byte, Value::Integer(i)) => Variant::Byte(*i as u8),
        (VariantType::Int16, Value::Integer(i)) => Variant::Int16(*i as i16),
        (VariantType::UInt16, Value::Integer(i)) => Variant::UInt16(*i as u16),
        (VariantType::Int32, Value::Integer(i)) => Variant::Int32(*i as i32),
        (VariantType::UInt32, Value::Integer(i)) => Variant::UInt32(*i as u32),
        (VariantType::Int64, Value::Integer(i)) => Variant::Int64(*i),
        (VariantType::UInt64, Value::Integer(i)) => Variant::UInt64(*i as u64),
        (VariantType::Float, Value::Float(f)) => Variant::Float(*f as f32),
        (VariantType::Double, Value::Float(f)) => Variant::Double(*f),
        (VariantType::String, Value::String(s)) => Variant::String(UAString::from(s.as_str())),
        // Undeclared types take the natural encoding of the value.
        (_, Value::Bool(b)) => Variant::Boolean(*b),
        (_, Value::Integer(i)) => Variant::Int64(*i),
        (_, Value::Float(f)) => Variant::Double(*f),
        (_, Value::String(s)) => Variant::String(UAString::from(s.as_str())),
        (_, other) => return Err(mismatch(other)),
    })
}
