//! Poll scheduler.
//!
//! Each tick reconnects the endpoints that are due, reads every endpoint,
//! and hands the snapshots to the broadcast hub. Per-endpoint work runs on
//! spawned tasks bounded by a semaphore, so the number of endpoints touched
//! at once never exceeds the configured worker count.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gateway::client::EndpointClient;
use crate::gateway::frame::TelemetrySnapshot;
use crate::gateway::hub::BroadcastHub;

/// Endpoint clients in configuration order, fixed after startup.
pub struct ClientRegistry {
    clients: Vec<Arc<EndpointClient>>,
    by_address: HashMap<String, usize>,
}

impl ClientRegistry {
    pub fn new(clients: Vec<Arc<EndpointClient>>) -> Self {
        let by_address = clients
            .iter()
            .enumerate()
            .map(|(i, c)| (c.address().to_string(), i))
            .collect();
        Self {
            clients,
            by_address,
        }
    }

    pub fn get(&self, address: &str) -> Option<&Arc<EndpointClient>> {
        self.by_address.get(address).map(|&i| &self.clients[i])
    }

    pub fn clients(&self) -> &[Arc<EndpointClient>] {
        &self.clients
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EndpointClient>> {
        self.clients.iter()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Poller timing and pool size.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
    pub error_cooldown: Duration,
    pub workers: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(300),
            error_cooldown: Duration::from_secs(5),
            workers: 2,
        }
    }
}

pub struct Poller {
    registry: Arc<ClientRegistry>,
    hub: Arc<BroadcastHub>,
    config: PollerConfig,
    workers: Arc<Semaphore>,
}

impl Poller {
    pub fn new(registry: Arc<ClientRegistry>, hub: Arc<BroadcastHub>, config: PollerConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            registry,
            hub,
            config,
            workers,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Clients eligible for a reconnect at `now`.
    pub fn reconnect_candidates(&self, now: Instant) -> Vec<Arc<EndpointClient>> {
        self.registry
            .iter()
            .filter(|c| c.reconnect_due(now, self.config.reconnect_backoff))
            .cloned()
            .collect()
    }

    /// Run `job` for every client on the worker pool; results keep client order.
    async fn dispatch<T, F, Fut>(&self, clients: &[Arc<EndpointClient>], job: F) -> Vec<(Arc<EndpointClient>, Option<T>)>
    where
        F: Fn(Arc<EndpointClient>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = clients
            .iter()
            .map(|client| {
                let workers = self.workers.clone();
                let work = job(client.clone());
                tokio::spawn(async move {
                    let _permit = workers.acquire_owned().await.ok();
                    work.await
                })
            })
            .collect();

        clients
            .iter()
            .cloned()
            .zip(join_all(handles).await)
            .map(|(client, joined)| match joined {
                Ok(value) => (client, Some(value)),
                Err(e) => {
                    error!(endpoint = %client.name(), error = %e, "worker task failed");
                    (client, None)
                }
            })
            .collect()
    }

    /// One scheduler pass. Returns the snapshots that were broadcast.
    pub async fn tick(&self) -> Vec<TelemetrySnapshot> {
        let due = self.reconnect_candidates(Instant::now());
        if !due.is_empty() {
            debug!(count = due.len(), "reconnecting endpoints");
            for (client, outcome) in self
                .dispatch(&due, |c| async move { c.connect_and_discover().await })
                .await
            {
                if let Some(Err(e)) = outcome {
                    debug!(endpoint = %client.name(), error = %e, "reconnect failed");
                }
            }
        }

        let snapshots: Vec<TelemetrySnapshot> = self
            .dispatch(self.registry.clients(), |c| async move { c.read_data().await })
            .await
            .into_iter()
            .map(|(client, snapshot)| {
                snapshot.unwrap_or_else(|| {
                    client
                        .status_only_snapshot()
                        .with_error("Internal read failure.")
                })
            })
            .collect();

        let report = self.hub.broadcast(&snapshots).await;
        debug!(
            endpoints = snapshots.len(),
            delivered = report.delivered,
            dropped = report.dropped,
            removed = report.removed,
            "tick complete"
        );
        snapshots
    }

    /// Tick until `shutdown` fires. A tick that panics is logged and
    /// followed by the error cooldown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            endpoints = self.registry.len(),
            interval = ?self.config.poll_interval,
            workers = self.config.workers,
            "poller started"
        );

        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = AssertUnwindSafe(self.tick()).catch_unwind() => outcome,
            };

            let pause = match outcome {
                Ok(_) => self.config.poll_interval,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(%reason, cooldown = ?self.config.error_cooldown, "tick failed");
                    self.config.error_cooldown
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("poller stopped");
    }
}
