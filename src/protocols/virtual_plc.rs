//! Virtual PLC for simulation and testing.
//!
//! A virtual PLC does not talk to any physical device. It holds an in-memory
//! address space (objects, variables, values, declared types) and implements
//! the same [`PlcConnector`]/[`PlcSession`] seam as the OPC UA adapter, so the
//! whole runtime can be driven against it.
//!
//! Faults can be injected per operation (fail, status error, hang, delay) to
//! exercise timeouts and error classification. Every session operation is
//! counted by an overlap detector, which lets tests observe whether two
//! operations against the same controller ever ran at the same time.
//!
//! # Example
//!
//! ```rust
//! use scada_gateway::core::{Value, VariantType};
//! use scada_gateway::protocols::virtual_plc::{VirtualConnector, VirtualPlc};
//!
//! let plc = VirtualPlc::new("SimServer", "ns=1;s=Root");
//! plc.add_object("ns=1;s=Root", "ns=1;s=Line1", "Line1");
//! plc.add_variable("ns=1;s=Line1", "ns=1;s=Speed", "Speed", VariantType::Double, Value::Float(12.5));
//!
//! let connector = VirtualConnector::new();
//! connector.register("opc.tcp://sim:4840", plc);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::core::data::{Value, VariantType};
use crate::core::error::{GatewayError, Result};
use crate::core::traits::{NodeClass, NodeHandle, NodeRef, PlcConnector, PlcSession};

/// Injected behavior for one operation kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Fault {
    /// Behave normally.
    #[default]
    None,
    /// Fail with a transient transport error.
    Fail(String),
    /// Fail with a protocol-level status error.
    Status(String),
    /// Never complete.
    Hang,
    /// Complete normally after a delay.
    Delay(Duration),
    /// Fail with a status error after a delay.
    StatusAfter(Duration, String),
}

impl Fault {
    async fn apply(&self) -> Result<()> {
        match self {
            Self::None => Ok(()),
            Self::Fail(msg) => Err(GatewayError::Transport(msg.clone())),
            Self::Status(msg) => Err(GatewayError::Status(msg.clone())),
            Self::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Self::Delay(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
            Self::StatusAfter(d, msg) => {
                tokio::time::sleep(*d).await;
                Err(GatewayError::Status(msg.clone()))
            }
        }
    }
}

/// Operation kinds that accept an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    ServerName,
    Browse,
    Read,
    Write,
}

#[derive(Debug, Clone)]
struct VirtualNode {
    browse_name: String,
    class: NodeClass,
    children: Vec<NodeHandle>,
    value: Value,
    data_type: VariantType,
}

struct PlcState {
    server_name: String,
    root: NodeHandle,
    nodes: DashMap<NodeHandle, VirtualNode>,
    faults: DashMap<Operation, Fault>,
    /// Nodes whose child listing fails.
    broken_branches: Mutex<HashSet<NodeHandle>>,
    /// Applied writes in order.
    journal: Mutex<Vec<(NodeHandle, Value)>>,
    connects: AtomicU64,
    closes: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// An in-memory controller.
///
/// Cheap to clone; clones share the same address space.
#[derive(Clone)]
pub struct VirtualPlc {
    state: Arc<PlcState>,
}

impl VirtualPlc {
    /// Create a controller whose address space contains only `root` (an object).
    pub fn new(server_name: impl Into<String>, root: impl Into<NodeHandle>) -> Self {
        let root = root.into();
        let nodes = DashMap::new();
        nodes.insert(
            root.clone(),
            VirtualNode {
                browse_name: "Root".to_string(),
                class: NodeClass::Object,
                children: Vec::new(),
                value: Value::Null,
                data_type: VariantType::Other(0),
            },
        );

        Self {
            state: Arc::new(PlcState {
                server_name: server_name.into(),
                root,
                nodes,
                faults: DashMap::new(),
                broken_branches: Mutex::new(HashSet::new()),
                journal: Mutex::new(Vec::new()),
                connects: AtomicU64::new(0),
                closes: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Root node handle.
    pub fn root(&self) -> &NodeHandle {
        &self.state.root
    }

    fn insert(&self, parent: &str, handle: &str, node: VirtualNode) {
        let handle = NodeHandle::from(handle);
        self.state.nodes.insert(handle.clone(), node);
        if let Some(mut p) = self.state.nodes.get_mut(&NodeHandle::from(parent)) {
            p.children.push(handle);
        }
    }

    /// Add a structural (non-variable) node under `parent`.
    pub fn add_object(&self, parent: &str, handle: &str, browse_name: &str) {
        self.insert(
            parent,
            handle,
            VirtualNode {
                browse_name: browse_name.to_string(),
                class: NodeClass::Object,
                children: Vec::new(),
                value: Value::Null,
                data_type: VariantType::Other(0),
            },
        );
    }

    /// Add a readable variable under `parent`.
    pub fn add_variable(
        &self,
        parent: &str,
        handle: &str,
        browse_name: &str,
        data_type: VariantType,
        value: Value,
    ) {
        self.insert(
            parent,
            handle,
            VirtualNode {
                browse_name: browse_name.to_string(),
                class: NodeClass::Variable,
                children: Vec::new(),
                value,
                data_type,
            },
        );
    }

    /// Add an array variable with one boolean child per bit, labelled `[i]`.
    pub fn add_bit_array(&self, parent: &str, handle: &str, browse_name: &str, bits: usize) {
        self.add_variable(
            parent,
            handle,
            browse_name,
            VariantType::Boolean,
            Value::Array(vec![Value::Bool(false); bits]),
        );
        for i in 0..bits {
            let child = format!("{}[{}]", handle, i);
            self.add_variable(
                handle,
                &child,
                &format!("[{}]", i),
                VariantType::Boolean,
                Value::Bool(false),
            );
        }
    }

    /// Remove a node and detach it from its parent.
    pub fn remove(&self, handle: &str) {
        let handle = NodeHandle::from(handle);
        self.state.nodes.remove(&handle);
        for mut node in self.state.nodes.iter_mut() {
            node.children.retain(|c| c != &handle);
        }
    }

    /// Overwrite a point value (simulates the process changing).
    pub fn set_value(&self, handle: &str, value: Value) {
        if let Some(mut node) = self.state.nodes.get_mut(&NodeHandle::from(handle)) {
            node.value = value;
        }
    }

    /// Current value of a point.
    pub fn value(&self, handle: &str) -> Option<Value> {
        self.state
            .nodes
            .get(&NodeHandle::from(handle))
            .map(|n| n.value.clone())
    }

    /// Inject a fault for an operation kind.
    pub fn set_fault(&self, op: Operation, fault: Fault) {
        self.state.faults.insert(op, fault);
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.state.faults.clear();
        if let Ok(mut broken) = self.state.broken_branches.lock() {
            broken.clear();
        }
    }

    /// Make child listing of `handle` fail.
    pub fn break_branch(&self, handle: &str) {
        if let Ok(mut broken) = self.state.broken_branches.lock() {
            broken.insert(NodeHandle::from(handle));
        }
    }

    /// Writes applied so far, oldest first.
    pub fn journal(&self) -> Vec<(NodeHandle, Value)> {
        self.state
            .journal
            .lock()
            .map(|j| j.clone())
            .unwrap_or_default()
    }

    /// Number of sessions opened.
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of fast transport closes received.
    pub fn close_count(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Highest number of session operations ever observed running at once.
    pub fn max_concurrent_ops(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    fn fault(&self, op: Operation) -> Fault {
        self.state
            .faults
            .get(&op)
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    fn node(&self, handle: &NodeHandle) -> Result<VirtualNode> {
        self.state
            .nodes
            .get(handle)
            .map(|n| n.clone())
            .ok_or_else(|| GatewayError::Status(format!("BadNodeIdUnknown: {}", handle)))
    }
}

/// Tracks one in-flight session operation for the overlap detector.
struct OpSpan<'a> {
    state: &'a PlcState,
}

impl<'a> OpSpan<'a> {
    fn enter(state: &'a PlcState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { state }
    }
}

impl Drop for OpSpan<'_> {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector resolving addresses to registered virtual PLCs.
#[derive(Clone, Default)]
pub struct VirtualConnector {
    plcs: Arc<DashMap<String, VirtualPlc>>,
}

impl VirtualConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `plc` reachable at `address`.
    pub fn register(&self, address: impl Into<String>, plc: VirtualPlc) {
        self.plcs.insert(address.into(), plc);
    }

    /// Controller registered at `address`.
    pub fn plc(&self, address: &str) -> Option<VirtualPlc> {
        self.plcs.get(address).map(|p| p.clone())
    }

    /// Build a connector with one small demo controller per address.
    ///
    /// Each controller exposes `Power`, `Voltage`, `Setpoint`, `Running` and a
    /// two-bit `CMD_Instant_Cutoff` under `root`.
    pub fn demo<'a>(addresses: impl IntoIterator<Item = &'a str>, root: &str) -> Self {
        let connector = Self::new();
        for (i, address) in addresses.into_iter().enumerate() {
            let plc = VirtualPlc::new(format!("Virtual PLC {}", i + 1), root);
            let ns = format!("ns=2;s=Plc{}", i + 1);
            plc.add_object(root, &format!("{}.Meter", ns), "Meter");
            plc.add_variable(
                &format!("{}.Meter", ns),
                &format!("{}.Power", ns),
                "Power",
                VariantType::Double,
                Value::Float(0.0),
            );
            plc.add_variable(
                &format!("{}.Meter", ns),
                &format!("{}.Voltage", ns),
                "Voltage",
                VariantType::Float,
                Value::Float(400.0),
            );
            plc.add_variable(
                root,
                &format!("{}.Setpoint", ns),
                "Setpoint",
                VariantType::Int32,
                Value::Integer(100),
            );
            plc.add_variable(
                root,
                &format!("{}.Running", ns),
                "Running",
                VariantType::Boolean,
                Value::Bool(true),
            );
            plc.add_bit_array(root, &format!("{}.Cutoff", ns), "CMD_Instant_Cutoff", 2);
            connector.register(address, plc);
        }
        connector
    }
}

#[async_trait]
impl PlcConnector for VirtualConnector {
    fn protocol(&self) -> &'static str {
        "virtual"
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn PlcSession>> {
        let plc = self
            .plc(address)
            .ok_or_else(|| GatewayError::Connection(format!("no route to {}", address)))?;

        plc.fault(Operation::Connect).apply().await?;
        plc.state.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(VirtualSession {
            plc,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session against a [`VirtualPlc`].
pub struct VirtualSession {
    plc: VirtualPlc,
    closed: AtomicBool,
}

impl VirtualSession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PlcSession for VirtualSession {
    async fn server_name(&self) -> Result<String> {
        self.ensure_open()?;
        let _span = OpSpan::enter(&self.plc.state);
        self.plc.fault(Operation::ServerName).apply().await?;
        Ok(self.plc.state.server_name.clone())
    }

    async fn describe(&self, node: &NodeHandle) -> Result<NodeRef> {
        self.ensure_open()?;
        let _span = OpSpan::enter(&self.plc.state);
        self.plc.fault(Operation::Browse).apply().await?;
        let n = self.plc.node(node)?;
        Ok(NodeRef::new(node.clone(), n.browse_name, n.class))
    }

    async fn children(&self, node: &NodeHandle) -> Result<Vec<NodeRef>> {
        self.ensure_open()?;
        let _span = OpSpan::enter(&self.plc.state);
        self.plc.fault(Operation::Browse).apply().await?;

        let broken = self
            .plc
            .state
            .broken_branches
            .lock()
            .map(|b| b.contains(node))
            .unwrap_or(false);
        if broken {
            return Err(GatewayError::Status(format!("BadBrowseNameInvalid: {}", node)));
        }

        let parent = self.plc.node(node)?;
        let mut refs = Vec::with_capacity(parent.children.len());
        for child in &parent.children {
            if let Ok(c) = self.plc.node(child) {
                refs.push(NodeRef::new(child.clone(), c.browse_name, c.class));
            }
        }
        Ok(refs)
    }

    async fn read_values(&self, nodes: &[NodeHandle]) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let _span = OpSpan::enter(&self.plc.state);
        self.plc.fault(Operation::Read).apply().await?;

        Ok(nodes
            .iter()
            .map(|h| self.plc.node(h).map(|n| n.value).unwrap_or_default())
            .collect())
    }

    async fn data_type(&self, node: &NodeHandle) -> Result<VariantType> {
        self.ensure_open()?;
        let _span = OpSpan::enter(&self.plc.state);
        Ok(self.plc.node(node)?.data_type)
    }

    async fn write_value(&self, node: &NodeHandle, value: Value, _ty: VariantType) -> Result<()> {
        self.ensure_open()?;
        let _span = OpSpan::enter(&self.plc.state);
        self.plc.fault(Operation::Write).apply().await?;

        let mut entry = self
            .plc
            .state
            .nodes
            .get_mut(node)
            .ok_or_else(|| GatewayError::Status(format!("BadNodeIdUnknown: {}", node)))?;
        if entry.class != NodeClass::Variable {
            return Err(GatewayError::Status(format!("BadNotWritable: {}", node)));
        }
        entry.value = value.clone();
        drop(entry);

        if let Ok(mut journal) = self.plc.state.journal.lock() {
            journal.push((node.clone(), value));
        }
        Ok(())
    }

    fn close_transport(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.plc.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
