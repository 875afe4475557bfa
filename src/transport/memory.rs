//! In-process transport hub.
//!
//! The hub behaves like the TCP transport without sockets: bounded per-peer
//! queues, `WouldBlock` on a full queue, and `PeerGone` plus a
//! [`ServerEvent::Disconnected`] once a connection is dropped. Tests use
//! [`MemoryHub::disconnect_all`] to simulate a publisher going away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ClientTransport, Connection, PeerId, SendOutcome, ServerEvent, ServerTransport};
use crate::{RelayError, Result};

const INBOUND_QUEUE: usize = 1024;
const ENDPOINT: &str = "memory";

type Peers = HashMap<PeerId, mpsc::Sender<Bytes>>;

#[derive(Debug)]
struct HubInner {
    peers: Mutex<Peers>,
    inbound_tx: mpsc::Sender<ServerEvent>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<ServerEvent>>,
    next_peer: AtomicU32,
    queue_depth: usize,
}

impl HubInner {
    fn peers(&self) -> MutexGuard<'_, Peers> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget `peer` and tell the server side, once.
    fn disconnect(&self, peer: PeerId) {
        if self.peers().remove(&peer).is_none() {
            return;
        }
        if self.inbound_tx.try_send(ServerEvent::Disconnected { peer }).is_err() {
            debug!(peer, "Inbound queue full, disconnect not reported");
        }
    }
}

/// Publisher side of the in-process transport.
///
/// Cloning the hub yields another handle to the same hub.
#[derive(Debug, Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Hub buffering up to `queue_depth` messages per peer.
    pub fn new(queue_depth: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            inner: Arc::new(HubInner {
                peers: Mutex::default(),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                next_peer: AtomicU32::new(1),
                queue_depth: queue_depth.max(1),
            }),
        }
    }

    /// Client transport connecting to this hub.
    pub fn client(&self) -> MemoryClient {
        MemoryClient { hub: self.clone() }
    }

    /// Number of open connections.
    pub fn peer_count(&self) -> usize {
        self.inner.peers().len()
    }

    /// Drop every connection, as if the publisher process exited.
    pub fn disconnect_all(&self) {
        let peers: Vec<PeerId> = self.inner.peers().keys().copied().collect();
        debug!(peers = peers.len(), "Disconnecting all memory peers");
        for peer in peers {
            self.inner.disconnect(peer);
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait::async_trait]
impl ServerTransport for MemoryHub {
    fn try_send(&self, peer: PeerId, message: Bytes) -> SendOutcome {
        let Some(sender) = self.inner.peers().get(&peer).cloned() else {
            return SendOutcome::PeerGone;
        };
        match sender.try_send(message) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::WouldBlock,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::PeerGone,
        }
    }

    async fn recv(&self) -> Result<ServerEvent> {
        let mut inbound = self.inner.inbound_rx.lock().await;
        inbound.recv().await.ok_or_else(|| RelayError::transport("receive on closed hub"))
    }

    fn endpoint(&self) -> String {
        ENDPOINT.to_string()
    }
}

/// Subscriber side of the in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    hub: MemoryHub,
}

#[async_trait::async_trait]
impl ClientTransport for MemoryClient {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection> {
        let inner = &self.hub.inner;
        let peer = inner.next_peer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(inner.queue_depth);
        inner.peers().insert(peer, tx);
        debug!(peer, "Memory peer connected");
        Ok(MemoryConnection {
            peer,
            to_hub: inner.inbound_tx.clone(),
            from_hub: rx,
            hub: Arc::downgrade(inner),
        })
    }

    fn endpoint(&self) -> String {
        ENDPOINT.to_string()
    }
}

/// One connection to a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryConnection {
    peer: PeerId,
    to_hub: mpsc::Sender<ServerEvent>,
    from_hub: mpsc::Receiver<Bytes>,
    hub: std::sync::Weak<HubInner>,
}

impl MemoryConnection {
    /// The routing id the hub assigned to this connection.
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.disconnect(self.peer);
        }
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, message: Bytes) -> Result<()> {
        self.to_hub
            .send(ServerEvent::Request { peer: self.peer, message })
            .await
            .map_err(|_| RelayError::connection_closed(ENDPOINT))
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let received = tokio::time::timeout(timeout, self.from_hub.recv()).await;
        match received {
            Err(_) => Ok(None),
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(RelayError::connection_closed(ENDPOINT)),
        }
    }
}
