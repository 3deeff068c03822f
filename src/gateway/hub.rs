//! Telemetry fan-out to subscriber sessions.
//!
//! Sessions are grouped by viewer identity. Each session carries its own
//! visibility filter, fixed at subscribe time, and a bounded channel to its
//! transport writer. A push never waits: a full channel drops that frame for
//! that session, a closed channel marks the session for removal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::gateway::frame::{TelemetryFrame, TelemetrySnapshot};

/// Opaque handle of one subscriber session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Which endpoints a session may see.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    All,
    /// Only these endpoint addresses.
    Only(HashSet<String>),
}

impl Visibility {
    pub fn only<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(addresses.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, address: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(address),
        }
    }

    /// Snapshots this filter lets through, in input order.
    pub fn filter(&self, snapshots: &[TelemetrySnapshot]) -> Vec<TelemetrySnapshot> {
        snapshots
            .iter()
            .filter(|s| self.allows(&s.address))
            .cloned()
            .collect()
    }
}

/// One live viewer connection.
pub struct SubscriberSession {
    pub id: SessionId,
    pub viewer: String,
    visibility: Visibility,
    tx: mpsc::Sender<Arc<String>>,
    dropped: AtomicU64,
}

enum Push {
    Sent,
    Dropped,
    Closed,
}

impl SubscriberSession {
    /// Frames dropped because the transport buffer was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, frame: Arc<String>) -> Push {
        match self.tx.try_send(frame) {
            Ok(()) => Push::Sent,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Push::Dropped
            }
            Err(TrySendError::Closed(_)) => Push::Closed,
        }
    }
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

/// Registry of subscriber sessions keyed by viewer.
pub struct BroadcastHub {
    viewers: RwLock<HashMap<String, HashMap<SessionId, Arc<SubscriberSession>>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a session. Frames start arriving on the next broadcast.
    pub async fn subscribe(
        &self,
        viewer: impl Into<String>,
        visibility: Visibility,
        tx: mpsc::Sender<Arc<String>>,
    ) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let viewer = viewer.into();
        let session = Arc::new(SubscriberSession {
            id,
            viewer: viewer.clone(),
            visibility,
            tx,
            dropped: AtomicU64::new(0),
        });

        let mut viewers = self.viewers.write().await;
        viewers.entry(viewer.clone()).or_default().insert(id, session);
        debug!(%viewer, session = %id, "session subscribed");
        id
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub async fn unsubscribe(&self, id: SessionId) -> bool {
        let mut viewers = self.viewers.write().await;
        let owner = viewers
            .iter()
            .find(|(_, sessions)| sessions.contains_key(&id))
            .map(|(viewer, _)| viewer.clone());

        match owner {
            Some(viewer) => {
                if let Some(sessions) = viewers.get_mut(&viewer) {
                    sessions.remove(&id);
                    if sessions.is_empty() {
                        viewers.remove(&viewer);
                    }
                }
                debug!(%viewer, session = %id, "session unsubscribed");
                true
            }
            None => false,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.viewers.read().await.values().map(HashMap::len).sum()
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    async fn sessions(&self) -> Vec<Arc<SubscriberSession>> {
        self.viewers
            .read()
            .await
            .values()
            .flat_map(|sessions| sessions.values().cloned())
            .collect()
    }

    /// Push one tick's snapshots to every session through its filter.
    ///
    /// Works on a copy of the session list, so subscribe and unsubscribe
    /// never wait on delivery. Sessions found closed are removed afterwards.
    pub async fn broadcast(&self, snapshots: &[TelemetrySnapshot]) -> BroadcastReport {
        let sessions = self.sessions().await;
        let mut report = BroadcastReport::default();
        if sessions.is_empty() {
            return report;
        }

        let mut unfiltered: Option<Arc<String>> = None;
        let mut closed = Vec::new();

        for session in &sessions {
            let frame = match &session.visibility {
                Visibility::All => {
                    if unfiltered.is_none() {
                        unfiltered = encode(snapshots.to_vec());
                    }
                    unfiltered.clone()
                }
                filter @ Visibility::Only(_) => encode(filter.filter(snapshots)),
            };
            let Some(frame) = frame else { continue };

            match session.push(frame) {
                Push::Sent => report.delivered += 1,
                Push::Dropped => {
                    warn!(
                        viewer = %session.viewer,
                        session = %session.id,
                        total = session.dropped_frames(),
                        "subscriber buffer full, frame dropped"
                    );
                    report.dropped += 1;
                }
                Push::Closed => {
                    debug!(viewer = %session.viewer, session = %session.id, "subscriber transport closed");
                    closed.push(session.id);
                }
            }
        }

        for id in closed {
            if self.unsubscribe(id).await {
                report.removed += 1;
            }
        }
        report
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(snapshots: Vec<TelemetrySnapshot>) -> Option<Arc<String>> {
    match TelemetryFrame::from_snapshots(snapshots).to_json() {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(error = %e, "failed to encode telemetry frame");
            None
        }
    }
}
