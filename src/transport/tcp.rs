//! TCP transport.
//!
//! Each accepted connection gets its own [`PeerId`], a reader task feeding the
//! shared inbound queue and a writer task draining a bounded per-peer queue.
//! A full queue surfaces as [`SendOutcome::WouldBlock`], so a slow subscriber
//! loses frames instead of stalling the publisher.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::framing::{MessageReader, write_message};
use super::{ClientTransport, Connection, PeerId, SendOutcome, ServerEvent, ServerTransport};
use crate::{RelayError, Result};

type PeerMap = Arc<Mutex<HashMap<PeerId, mpsc::Sender<Bytes>>>>;

/// Inbound requests buffered before readers start waiting.
const INBOUND_QUEUE: usize = 1024;

/// Publisher side TCP transport.
#[derive(Debug)]
pub struct TcpServer {
    local_addr: SocketAddr,
    peers: PeerMap,
    inbound: tokio::sync::Mutex<mpsc::Receiver<ServerEvent>>,
    cancel: CancellationToken,
}

impl TcpServer {
    /// Bind `addr` and start accepting subscribers.
    ///
    /// `queue_depth` bounds the number of messages buffered per peer.
    pub async fn bind(addr: SocketAddr, queue_depth: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            RelayError::transport_with_source(format!("bind {}", addr), Box::new(e))
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Publisher listening");

        let peers: PeerMap = Arc::default();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&peers),
            inbound_tx,
            queue_depth.max(1),
            cancel.clone(),
        ));

        Ok(Self { local_addr, peers, inbound: tokio::sync::Mutex::new(inbound_rx), cancel })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // Readers and the accept loop stop now; writers drain their queues
        // once the peer map, and with it every sender, is gone.
        self.cancel.cancel();
    }
}

#[async_trait::async_trait]
impl ServerTransport for TcpServer {
    fn try_send(&self, peer: PeerId, message: Bytes) -> SendOutcome {
        let sender = match self.peers.lock() {
            Ok(peers) => peers.get(&peer).cloned(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return SendOutcome::PeerGone;
        };
        match sender.try_send(message) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::WouldBlock,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::PeerGone,
        }
    }

    async fn recv(&self) -> Result<ServerEvent> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or_else(|| RelayError::transport("receive on closed listener"))
    }

    fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: PeerMap,
    inbound: mpsc::Sender<ServerEvent>,
    queue_depth: usize,
    cancel: CancellationToken,
) {
    let next_peer = AtomicU32::new(1);
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, addr)) => {
                let peer = next_peer.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = socket.set_nodelay(true) {
                    warn!(peer, error = %e, "Failed to set TCP_NODELAY");
                }
                debug!(peer, addr = %addr, "Subscriber connected");

                let (read_half, write_half) = socket.into_split();
                let (tx, rx) = mpsc::channel(queue_depth);
                if let Ok(mut map) = peers.lock() {
                    map.insert(peer, tx);
                }

                tokio::spawn(peer_writer(peer, write_half, rx));
                tokio::spawn(peer_reader(
                    peer,
                    read_half,
                    inbound.clone(),
                    Arc::clone(&peers),
                    cancel.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
            }
        }
    }
    debug!("Accept loop stopped");
}

async fn peer_reader(
    peer: PeerId,
    read_half: OwnedReadHalf,
    inbound: mpsc::Sender<ServerEvent>,
    peers: PeerMap,
    cancel: CancellationToken,
) {
    let mut reader = MessageReader::new(read_half);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next_message() => next,
        };
        match next {
            Ok(Some(message)) => {
                trace!(peer, len = message.len(), "Request received");
                if inbound.send(ServerEvent::Request { peer, message }).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(peer, "Subscriber disconnected");
                break;
            }
            Err(e) => {
                debug!(peer, error = %e, "Subscriber connection failed");
                break;
            }
        }
    }
    if let Ok(mut map) = peers.lock() {
        map.remove(&peer);
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = inbound.send(ServerEvent::Disconnected { peer }) => {}
    }
}

async fn peer_writer(peer: PeerId, mut write_half: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = write_message(&mut write_half, &message).await {
            debug!(peer, error = %e, "Write to subscriber failed");
            // Closing the queue turns further sends into PeerGone.
            queue.close();
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Subscriber side TCP transport.
#[derive(Debug, Clone)]
pub struct TcpClient {
    address: String,
}

impl TcpClient {
    /// Client connecting to `address` (`host:port`).
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

#[async_trait::async_trait]
impl ClientTransport for TcpClient {
    type Connection = TcpConnection;

    async fn connect(&self) -> Result<TcpConnection> {
        let socket = TcpStream::connect(&self.address).await.map_err(|e| {
            RelayError::transport_with_source(format!("connect {}", self.address), Box::new(e))
        })?;
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();
        debug!(endpoint = %self.address, "Connected to publisher");
        Ok(TcpConnection {
            endpoint: self.address.clone(),
            reader: MessageReader::new(read_half),
            writer: write_half,
        })
    }

    fn endpoint(&self) -> String {
        self.address.clone()
    }
}

/// One subscriber TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    endpoint: String,
    reader: MessageReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TcpConnection {
    fn map_io(&self, operation: &str, e: io::Error) -> RelayError {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => RelayError::connection_closed(self.endpoint.clone()),
            _ => RelayError::transport_with_source(
                format!("{} {}", operation, self.endpoint),
                Box::new(e),
            ),
        }
    }
}

#[async_trait::async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, message: Bytes) -> Result<()> {
        let written = write_message(&mut self.writer, &message).await;
        match written {
            Ok(()) => Ok(()),
            Err(e) => Err(self.map_io("send to", e)),
        }
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let received = tokio::time::timeout(timeout, self.reader.next_message()).await;
        match received {
            Err(_) => Ok(None),
            Ok(Ok(Some(message))) => Ok(Some(message)),
            Ok(Ok(None)) => Err(RelayError::connection_closed(self.endpoint.clone())),
            Ok(Err(e)) => Err(self.map_io("receive from", e)),
        }
    }
}
