//! Correlated request/response over the single live peer connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use easel_core::types::ImageData;

use crate::error::BrokerError;
use crate::pending::PendingRequests;
use crate::protocol::{Envelope, Reply};

pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound half of an attached peer socket.
#[derive(Debug)]
pub struct PeerConnection {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl PeerConnection {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: String) -> Result<(), BrokerError> {
        self.tx.send(frame).map_err(|_| BrokerError::ConnectionClosed)
    }
}

pub struct PeerBroker {
    peer: RwLock<Option<PeerConnection>>,
    pending: PendingRequests<Reply>,
    next_request: AtomicU64,
}

impl Default for PeerBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerBroker {
    pub fn new() -> Self {
        Self {
            peer: RwLock::new(None),
            pending: PendingRequests::new(),
            next_request: AtomicU64::new(1),
        }
    }

    /// Ask the peer for an image of one page (the current page when `None`).
    pub async fn issue_snapshot(
        &self,
        page: Option<&str>,
        timeout: Duration,
    ) -> Result<ImageData, BrokerError> {
        let page = page.map(str::to_string);
        match self
            .request(|id| Envelope::SnapshotRequest { id, page }, timeout)
            .await?
        {
            Reply::Snapshot(image) => Ok(image),
            Reply::Export(_) => Err(BrokerError::UnexpectedReply(
                "export payload for a snapshot request".into(),
            )),
        }
    }

    /// Ask the peer for one image per page.
    pub async fn issue_export(&self, timeout: Duration) -> Result<Vec<ImageData>, BrokerError> {
        match self
            .request(|id| Envelope::ExportRequest { id }, timeout)
            .await?
        {
            Reply::Export(pages) => Ok(pages),
            Reply::Snapshot(_) => Err(BrokerError::UnexpectedReply(
                "snapshot payload for an export request".into(),
            )),
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(String) -> Envelope,
        timeout: Duration,
    ) -> Result<Reply, BrokerError> {
        let reply = {
            let peer = self.peer.read().await;
            let Some(conn) = peer.as_ref() else {
                return Err(BrokerError::NotConnected);
            };

            let id = format!("req-{}", self.next_request.fetch_add(1, Ordering::Relaxed));
            let frame = serde_json::to_string(&build(id.clone()))?;

            // Registered before sending so a fast reply always finds its entry.
            let reply = self.pending.register(&id, timeout).await;
            if let Err(e) = conn.send(frame) {
                self.pending.fail(&id, BrokerError::ConnectionClosed).await;
                return Err(e);
            }
            debug!(id = %id, conn = conn.id(), ?timeout, "Canvas request sent");
            reply
        };

        reply.wait().await
    }

    /// Route one inbound frame. Returns `true` if it answered a pending
    /// request; anything else is left for the sync layer.
    pub async fn on_inbound_message(&self, raw: &str) -> bool {
        let Some((id, outcome)) = Envelope::parse(raw).and_then(Envelope::into_reply) else {
            return false;
        };
        let handled = self.pending.complete(&id, outcome).await;
        if !handled {
            debug!(id = %id, "Reply for unknown or expired request");
        }
        handled
    }

    /// Replace the registered connection; `None` detaches. Outstanding
    /// requests are left to their timeouts.
    pub async fn attach_peer(&self, connection: Option<PeerConnection>) -> Option<PeerConnection> {
        let mut peer = self.peer.write().await;
        let previous = std::mem::replace(&mut *peer, connection);
        match (&previous, peer.as_ref()) {
            (Some(prev), Some(cur)) => {
                info!(replaced = prev.id(), conn = cur.id(), "Canvas peer replaced")
            }
            (None, Some(cur)) => info!(conn = cur.id(), "Canvas peer attached"),
            (Some(prev), None) => info!(conn = prev.id(), "Canvas peer detached"),
            (None, None) => {}
        }
        previous
    }

    /// Detach only if `connection_id` is still the registered peer.
    pub async fn release_peer(&self, connection_id: u64) -> bool {
        let mut peer = self.peer.write().await;
        if peer.as_ref().is_some_and(|c| c.id == connection_id) {
            *peer = None;
            info!(conn = connection_id, "Canvas peer detached");
            true
        } else {
            false
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.peer.read().await.is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }
}
