//! Gateway runtime.
//!
//! [`Gateway`] wires the endpoint clients, the poll scheduler, the broadcast
//! hub and the write coordinator together and exposes the operations the
//! request layer needs: subscribe/unsubscribe a viewer session, read current
//! data on demand, write a point, list endpoints, and shut down.
//!
//! ```rust,ignore
//! let config = GatewayConfig::load("gateway.toml")?;
//! let gateway = Gateway::new(config, Arc::new(OpcUaConnector::new(settings)))?;
//! gateway.start();
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(16);
//! let session = gateway.subscribe("operator@example.com", Visibility::All, tx).await;
//! ```

pub mod client;
pub mod config;
pub mod directory;
pub mod frame;
pub mod hub;
pub mod scheduler;
pub mod write;

pub use client::{EndpointClient, EndpointSummary};
pub use config::{EndpointDescriptor, GatewayConfig};
pub use frame::{NodeReading, TelemetryFrame, TelemetrySnapshot};
pub use hub::{BroadcastHub, SessionId, Visibility};
pub use scheduler::{ClientRegistry, Poller, PollerConfig};
pub use write::{WriteAck, WriteCoordinator, WriteError, WriteRequest};

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::error::Result;
use crate::core::traits::PlcConnector;

/// A running gateway instance.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ClientRegistry>,
    hub: Arc<BroadcastHub>,
    poller: Arc<Poller>,
    writer: WriteCoordinator,
    shutdown: CancellationToken,
    poller_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build the runtime from a validated configuration.
    ///
    /// No connection is opened here; the first poller tick connects.
    pub fn new(config: GatewayConfig, connector: Arc<dyn PlcConnector>) -> Result<Self> {
        config.validate()?;

        let timeouts = config.gateway.timeouts.to_timeouts();
        let clients = config
            .descriptors()
            .into_iter()
            .map(|d| Arc::new(EndpointClient::new(d, connector.clone(), timeouts)))
            .collect();
        let registry = Arc::new(ClientRegistry::new(clients));
        let hub = Arc::new(BroadcastHub::new());

        let poller = Arc::new(Poller::new(
            registry.clone(),
            hub.clone(),
            PollerConfig {
                poll_interval: config.poll_interval(),
                reconnect_backoff: config.reconnect_backoff(),
                error_cooldown: config.error_cooldown(),
                workers: config.worker_count(),
            },
        ));
        let writer = WriteCoordinator::new(registry.clone(), config.gateway.bit_array_point.clone());

        info!(
            gateway = %config.gateway.name,
            protocol = connector.protocol(),
            endpoints = registry.len(),
            "gateway created"
        );

        Ok(Self {
            config,
            registry,
            hub,
            poller,
            writer,
            shutdown: CancellationToken::new(),
            poller_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.gateway.name
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    /// Start the background poller. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.poller_task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        *task = Some(tokio::spawn(self.poller.clone().run(self.shutdown.clone())));
        info!(gateway = %self.config.gateway.name, "gateway started");
    }

    /// Register a viewer session; it receives frames from the next tick on.
    pub async fn subscribe(
        &self,
        viewer: impl Into<String>,
        visibility: Visibility,
        tx: mpsc::Sender<Arc<String>>,
    ) -> SessionId {
        self.hub.subscribe(viewer, visibility, tx).await
    }

    /// Remove a viewer session. Safe to call more than once.
    pub async fn unsubscribe(&self, session: SessionId) -> bool {
        self.hub.unsubscribe(session).await
    }

    /// Read the visible endpoints now and return the frame.
    pub async fn current_data(&self, visibility: &Visibility) -> TelemetryFrame {
        let reads = self
            .registry
            .iter()
            .filter(|c| visibility.allows(c.address()))
            .map(|c| c.read_data());
        TelemetryFrame::from_snapshots(join_all(reads).await)
    }

    pub async fn write(&self, request: &WriteRequest) -> std::result::Result<WriteAck, WriteError> {
        self.writer.write(request).await
    }

    /// Status summaries in configuration order.
    pub fn endpoints(&self) -> Vec<EndpointSummary> {
        self.registry.iter().map(|c| c.summary()).collect()
    }

    /// Stop polling and drop every connection.
    ///
    /// Waits at most `gateway.timeouts.shutdown_ms` for the poller, then
    /// force-closes every transport without the protocol handshake.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let task = self
            .poller_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut task) = task {
            let timeout = self.config.shutdown_timeout();
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                warn!(?timeout, "poller did not stop in time, aborting");
                task.abort();
            }
        }

        for client in self.registry.iter() {
            client.retire();
        }
        info!(gateway = %self.config.gateway.name, "gateway stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
