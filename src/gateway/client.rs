//! Endpoint client: one controller connection and its state machine.
//!
//! ```text
//! DISCONNECTED ──connect──▶ CONNECTING ──discover──▶ CONNECTED
//!       ▲                        │                        │
//!       └── connect failure ─────┘        read status ────┴──▶ ERROR
//! ```
//!
//! Every transport operation (connect, read, write) holds the client's
//! operation lock for its full duration, so operations against one endpoint
//! never interleave. The lock guards the node directory itself: code that
//! touches the directory necessarily holds the lock.
//!
//! Status, session and bookkeeping live behind a separate short-lived mutex
//! that is never held across an `.await`. This lets [`EndpointClient::disconnect_safe`]
//! and status queries run while a slow operation owns the operation lock.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, Phase, Result};
use crate::core::timeout::{guard, Timeouts};
use crate::core::traits::{ConnectionState, NodeHandle, PlcConnector, PlcSession};
use crate::gateway::config::EndpointDescriptor;
use crate::gateway::directory::{discover, NodeDirectory};
use crate::gateway::frame::{NodeReading, TelemetrySnapshot};

/// Snapshot error when the directory is empty.
pub const NO_READABLE_POINTS: &str = "No readable points.";

/// Snapshot error for a transient read failure.
pub const TEMPORARY_READ_FAILURE: &str = "Temporary read failure.";

#[derive(Default)]
struct ClientState {
    status: ConnectionState,
    session: Option<Arc<dyn PlcSession>>,
    server_name: Option<String>,
    point_count: usize,
    last_attempt: Option<Instant>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Point-in-time view of a client for status listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointSummary {
    pub name: String,
    pub address: String,
    pub root_node: String,
    pub status: ConnectionState,
    pub server_name: Option<String>,
    pub points: usize,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Connection to one controller.
pub struct EndpointClient {
    descriptor: EndpointDescriptor,
    connector: Arc<dyn PlcConnector>,
    timeouts: Timeouts,
    /// Operation lock; owns the node directory.
    directory: tokio::sync::Mutex<NodeDirectory>,
    state: Mutex<ClientState>,
    retired: AtomicBool,
}

impl EndpointClient {
    pub fn new(
        descriptor: EndpointDescriptor,
        connector: Arc<dyn PlcConnector>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            descriptor,
            connector,
            timeouts,
            directory: tokio::sync::Mutex::new(NodeDirectory::new()),
            state: Mutex::new(ClientState::default()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn address(&self) -> &str {
        &self.descriptor.address
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> ConnectionState {
        self.state().status
    }

    /// Server identity read during the last successful connect.
    pub fn server_name(&self) -> Option<String> {
        self.state().server_name.clone()
    }

    /// Monotonic time of the last connect attempt.
    pub fn last_attempt(&self) -> Option<Instant> {
        self.state().last_attempt
    }

    /// Whether a reconnect may be attempted at `now` under `backoff`.
    pub fn reconnect_due(&self, now: Instant, backoff: Duration) -> bool {
        if self.retired.load(Ordering::SeqCst) {
            return false;
        }
        let st = self.state();
        st.status.can_retry()
            && st
                .last_attempt
                .map_or(true, |last| now.saturating_duration_since(last) > backoff)
    }

    pub fn summary(&self) -> EndpointSummary {
        let st = self.state();
        EndpointSummary {
            name: self.descriptor.name.clone(),
            address: self.descriptor.address.clone(),
            root_node: self.descriptor.root_node.clone(),
            status: st.status,
            server_name: st.server_name.clone(),
            points: st.point_count,
            last_attempt_at: st.last_attempt_at,
            last_error: st.last_error.clone(),
        }
    }

    fn status_snapshot(&self, status: ConnectionState) -> TelemetrySnapshot {
        TelemetrySnapshot::status_only(&self.descriptor.name, &self.descriptor.address, status)
    }

    /// Snapshot with identity and current status only.
    pub fn status_only_snapshot(&self) -> TelemetrySnapshot {
        self.status_snapshot(self.status())
    }

    fn set_failed(&self, status: ConnectionState, error: &GatewayError) {
        let mut st = self.state();
        st.status = status;
        st.last_error = Some(error.to_string());
    }

    /// Move to `ERROR` after a failed read, unless the session that failed
    /// was replaced or closed meanwhile. Returns the resulting status.
    fn demote(&self, failed: &Arc<dyn PlcSession>, error: &GatewayError) -> ConnectionState {
        let mut st = self.state();
        let current = st
            .session
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(live, failed));
        if current && !self.retired.load(Ordering::SeqCst) {
            st.status = ConnectionState::Error;
            st.last_error = Some(error.to_string());
        }
        st.status
    }

    /// Open a fresh session and rebuild the node directory.
    ///
    /// The attempt time is recorded up front so backoff applies whatever the
    /// outcome. On failure the directory stays empty and the status is
    /// `DISCONNECTED` (connect failure, discovery error) or `ERROR`
    /// (discovery timeout).
    pub async fn connect_and_discover(&self) -> Result<()> {
        let mut directory = self.directory.lock().await;
        if self.retired.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }

        let previous = {
            let mut st = self.state();
            st.last_attempt = Some(Instant::now());
            st.last_attempt_at = Some(Utc::now());
            st.status = ConnectionState::Connecting;
            st.server_name = None;
            st.point_count = 0;
            st.session.take()
        };
        if let Some(old) = previous {
            close_quietly(old.as_ref());
        }
        directory.clear();

        info!(endpoint = %self.descriptor.name, address = %self.descriptor.address, "connecting");

        let connector = self.connector.clone();
        let address = self.descriptor.address.clone();
        let session = match guard(Phase::Connect, self.timeouts.connect, async move {
            connector.connect(&address).await
        })
        .await
        {
            Ok(session) => session,
            Err(e) => {
                log_failure(&self.descriptor, Phase::Connect, &e);
                self.set_failed(ConnectionState::Disconnected, &e);
                return Err(e);
            }
        };

        let meta = session.clone();
        let server_name = match guard(Phase::Metadata, self.timeouts.metadata, async move {
            meta.server_name().await
        })
        .await
        {
            Ok(name) => Some(name),
            Err(e) => {
                warn!(endpoint = %self.descriptor.name, error = %e, "server identity unavailable");
                None
            }
        };

        let root = NodeHandle::new(self.descriptor.root_node.clone());
        let found = match guard(
            Phase::Discovery,
            self.timeouts.discovery,
            discover(session.clone(), root),
        )
        .await
        {
            Ok(found) => found,
            Err(e) => {
                log_failure(&self.descriptor, Phase::Discovery, &e);
                close_quietly(session.as_ref());
                let status = if e.is_timeout() {
                    ConnectionState::Error
                } else {
                    ConnectionState::Disconnected
                };
                self.set_failed(status, &e);
                return Err(e);
            }
        };

        for (node, error) in &found.soft_errors {
            debug!(endpoint = %self.descriptor.name, %node, %error, "branch skipped during discovery");
        }

        // A shutdown that raced this connect wins.
        if self.retired.load(Ordering::SeqCst) {
            close_quietly(session.as_ref());
            return Err(GatewayError::NotConnected);
        }

        let points = found.directory.len();
        *directory = found.directory;
        {
            let mut st = self.state();
            st.status = ConnectionState::Connected;
            st.session = Some(session);
            st.server_name = server_name.clone();
            st.point_count = points;
            st.last_error = None;
        }

        info!(
            endpoint = %self.descriptor.name,
            server = server_name.as_deref().unwrap_or("-"),
            points,
            skipped = found.soft_errors.len(),
            "connected"
        );
        Ok(())
    }

    /// Drop the connection without the protocol's close handshake.
    ///
    /// Closes the raw transport, sets `DISCONNECTED` and returns. Never
    /// waits on the operation lock and never fails.
    pub fn disconnect_safe(&self) {
        let session = {
            let mut st = self.state();
            st.status = ConnectionState::Disconnected;
            st.point_count = 0;
            st.session.take()
        };
        if let Some(session) = session {
            close_quietly(session.as_ref());
        }
        // An operation still holding the lock will find the status changed.
        if let Ok(mut directory) = self.directory.try_lock() {
            directory.clear();
        }
        debug!(endpoint = %self.descriptor.name, "disconnected");
    }

    /// Disconnect and refuse any further connect attempts.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.disconnect_safe();
    }

    /// Read every discovered point in one round trip.
    ///
    /// Never fails: problems are reported on the snapshot. A protocol status
    /// error demotes the client to `ERROR`; any other read error leaves it
    /// `CONNECTED` so the next tick retries the read.
    pub async fn read_data(&self) -> TelemetrySnapshot {
        let directory = self.directory.lock().await;

        let (status, session) = {
            let st = self.state();
            (st.status, st.session.clone())
        };
        let session = match (status, session) {
            (ConnectionState::Connected, Some(session)) => session,
            (status, _) => return self.status_snapshot(status),
        };

        if directory.is_empty() {
            return self
                .status_snapshot(ConnectionState::Connected)
                .with_error(NO_READABLE_POINTS);
        }

        let handles = directory.handles();
        match session.read_values(&handles).await {
            Ok(values) => {
                let nodes = directory
                    .names()
                    .zip(values)
                    .map(|(name, value)| NodeReading::new(name, value))
                    .collect();
                self.status_snapshot(ConnectionState::Connected)
                    .with_nodes(nodes)
            }
            Err(e) if e.is_status() => {
                warn!(endpoint = %self.descriptor.name, error = %e, "read rejected, marking endpoint failed");
                let status = self.demote(&session, &e);
                self.status_snapshot(status)
                    .with_error(format!("read error: {}", e))
            }
            Err(e) => {
                warn!(endpoint = %self.descriptor.name, error = %e, "transient read failure");
                self.status_snapshot(self.status())
                    .with_error(TEMPORARY_READ_FAILURE)
            }
        }
    }

    /// Take the operation lock for a multi-step operation.
    pub async fn exclusive(&self) -> ClientAccess<'_> {
        ClientAccess {
            client: self,
            directory: self.directory.lock().await,
        }
    }
}

/// Exclusive access to one client, held for the lifetime of the value.
pub struct ClientAccess<'a> {
    client: &'a EndpointClient,
    directory: tokio::sync::MutexGuard<'a, NodeDirectory>,
}

impl ClientAccess<'_> {
    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    /// Live session, if the client is connected.
    pub fn session(&self) -> Option<Arc<dyn PlcSession>> {
        let st = self.client.state();
        match st.status {
            ConnectionState::Connected => st.session.clone(),
            _ => None,
        }
    }
}

fn close_quietly(session: &dyn PlcSession) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| session.close_transport())).is_err() {
        warn!("transport close panicked");
    }
}

fn log_failure(endpoint: &EndpointDescriptor, phase: Phase, error: &GatewayError) {
    if error.is_timeout() {
        warn!(endpoint = %endpoint.name, %phase, error = %error, "phase timed out");
    } else {
        warn!(endpoint = %endpoint.name, %phase, error = %error, "phase failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::data::{Value, VariantType};
    use crate::protocols::virtual_plc::{Fault, Operation, VirtualConnector, VirtualPlc};

    const ADDR: &str = "opc.tcp://sim:4840";

    fn plant() -> VirtualPlc {
        let plc = VirtualPlc::new("SimServer", "root");
        plc.add_object("root", "meter", "Meter");
        plc.add_variable("meter", "p", "Power", VariantType::Double, Value::Float(1.5));
        plc.add_variable("root", "run", "Running", VariantType::Boolean, Value::Bool(true));
        plc
    }

    fn client_for(plc: &VirtualPlc) -> EndpointClient {
        let connector = VirtualConnector::new();
        connector.register(ADDR, plc.clone());
        EndpointClient::new(
            EndpointDescriptor::new(ADDR, "Park", "root"),
            Arc::new(connector),
            Timeouts {
                connect: Duration::from_millis(200),
                metadata: Duration::from_millis(100),
                discovery: Duration::from_millis(300),
            },
        )
    }

    #[tokio::test]
    async fn test_connect_and_read() {
        let plc = plant();
        let client = client_for(&plc);

        client.connect_and_discover().await.unwrap();
        assert_eq!(client.status(), ConnectionState::Connected);
        assert_eq!(client.server_name().as_deref(), Some("SimServer"));

        let snap = client.read_data().await;
        assert_eq!(snap.status, ConnectionState::Connected);
        assert_eq!(snap.value("Power"), Some(&Value::Float(1.5)));
        assert_eq!(snap.value("Running"), Some(&Value::Bool(true)));
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_empty_directory() {
        let plc = plant();
        let client = client_for(&plc);
        client.connect_and_discover().await.unwrap();

        plc.set_fault(Operation::Connect, Fault::Fail("refused".into()));
        assert!(client.connect_and_discover().await.is_err());

        assert_eq!(client.status(), ConnectionState::Disconnected);
        assert!(client.exclusive().await.directory().is_empty());
        assert!(client.last_attempt().is_some());
        assert_eq!(client.summary().points, 0);
        // The previous session was released before reconnecting.
        assert_eq!(plc.close_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_directory() {
        let plc = plant();
        let client = client_for(&plc);
        client.connect_and_discover().await.unwrap();

        plc.remove("p");
        plc.add_variable("meter", "q", "Reactive", VariantType::Double, Value::Float(0.2));
        client.connect_and_discover().await.unwrap();

        let access = client.exclusive().await;
        let names: Vec<&str> = access.directory().names().collect();
        assert_eq!(names, vec!["Reactive", "Running"]);
        assert!(!access.directory().contains("Power"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let plc = plant();
        plc.set_fault(Operation::Connect, Fault::Hang);
        let client = client_for(&plc);

        let started = Instant::now();
        let err = client.connect_and_discover().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(client.status(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_timeout_is_not_fatal() {
        let plc = plant();
        plc.set_fault(Operation::ServerName, Fault::Hang);
        let client = client_for(&plc);

        client.connect_and_discover().await.unwrap();
        assert_eq!(client.status(), ConnectionState::Connected);
        assert!(client.server_name().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout_sets_error() {
        let plc = plant();
        plc.set_fault(Operation::Browse, Fault::Hang);
        let client = client_for(&plc);

        let err = client.connect_and_discover().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.status(), ConnectionState::Error);
        assert!(client.exclusive().await.directory().is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_disconnects() {
        let plc = plant();
        let connector = VirtualConnector::new();
        connector.register(ADDR, plc.clone());
        let client = EndpointClient::new(
            EndpointDescriptor::new(ADDR, "Park", "nowhere"),
            Arc::new(connector),
            Timeouts::default(),
        );

        assert!(client.connect_and_discover().await.is_err());
        assert_eq!(client.status(), ConnectionState::Disconnected);
        assert!(client.summary().last_error.is_some());
    }

    #[tokio::test]
    async fn test_read_when_not_connected() {
        let plc = plant();
        let client = client_for(&plc);

        let snap = client.read_data().await;
        assert_eq!(snap.status, ConnectionState::Disconnected);
        assert!(snap.nodes.is_empty());
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn test_read_empty_directory() {
        let plc = VirtualPlc::new("Empty", "root");
        let client = client_for(&plc);
        client.connect_and_discover().await.unwrap();

        let snap = client.read_data().await;
        assert_eq!(snap.status, ConnectionState::Connected);
        assert_eq!(snap.error.as_deref(), Some(NO_READABLE_POINTS));
    }

    #[tokio::test]
    async fn test_read_error_classification() {
        let plc = plant();
        let client = client_for(&plc);
        client.connect_and_discover().await.unwrap();

        plc.set_fault(Operation::Read, Fault::Fail("socket reset".into()));
        let snap = client.read_data().await;
        assert_eq!(snap.error.as_deref(), Some(TEMPORARY_READ_FAILURE));
        assert_eq!(client.status(), ConnectionState::Connected);

        plc.set_fault(Operation::Read, Fault::Status("BadSessionClosed".into()));
        let snap = client.read_data().await;
        assert_eq!(snap.status, ConnectionState::Error);
        assert!(snap.error.unwrap().starts_with("read error:"));
        assert_eq!(client.status(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_safe_does_not_wait_for_hung_read() {
        let plc = plant();
        let client = Arc::new(client_for(&plc));
        client.connect_and_discover().await.unwrap();

        plc.set_fault(Operation::Read, Fault::Hang);
        let reader = client.clone();
        let _pending = tokio::spawn(async move { reader.read_data().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = std::time::Instant::now();
        client.disconnect_safe();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.status(), ConnectionState::Disconnected);
        assert_eq!(plc.close_count(), 1);
    }

    #[tokio::test]
    async fn test_read_failing_after_retire_keeps_disconnected() {
        let plc = plant();
        let client = Arc::new(client_for(&plc));
        client.connect_and_discover().await.unwrap();

        plc.set_fault(
            Operation::Read,
            Fault::StatusAfter(Duration::from_millis(50), "BadSessionClosed".into()),
        );
        let reader = client.clone();
        let pending = tokio::spawn(async move { reader.read_data().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        client.retire();
        let snap = pending.await.unwrap();
        assert_eq!(snap.status, ConnectionState::Disconnected);
        assert!(snap.error.is_some());
        assert_eq!(client.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_retired_client_does_not_reconnect() {
        let plc = plant();
        let client = client_for(&plc);
        client.connect_and_discover().await.unwrap();

        client.retire();
        assert!(!client.reconnect_due(Instant::now(), Duration::ZERO));
        assert!(client.connect_and_discover().await.is_err());
        assert_eq!(plc.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_due_respects_backoff() {
        let plc = plant();
        plc.set_fault(Operation::Connect, Fault::Fail("refused".into()));
        let client = client_for(&plc);
        let backoff = Duration::from_secs(300);

        assert!(client.reconnect_due(Instant::now(), backoff));
        let _ = client.connect_and_discover().await;

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!client.reconnect_due(Instant::now(), backoff));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!client.reconnect_due(Instant::now(), backoff));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(client.reconnect_due(Instant::now(), backoff));
    }
}
