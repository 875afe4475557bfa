//! Message transport abstraction.
//!
//! Publishers sit behind a [`ServerTransport`]: one socket that receives
//! requests from many subscribers, each tagged with a [`PeerId`], and sends
//! addressed replies without ever blocking on a slow peer. Subscribers use a
//! [`ClientTransport`] to open one [`Connection`] per subscribed stream.
//!
//! Two implementations ship with the crate:
//!
//! - [`tcp`]: length-prefixed messages over TCP
//! - [`memory`]: an in-process hub for tests and single-process setups

mod framing;
pub mod memory;
pub mod tcp;

pub use framing::{MAX_MESSAGE_LEN, MessageReader, write_message};
pub use memory::{MemoryClient, MemoryConnection, MemoryHub};
pub use tcp::{TcpClient, TcpConnection, TcpServer};

use std::time::Duration;

use bytes::Bytes;

use crate::Result;

/// Routing identity of one connected subscriber.
pub type PeerId = u32;

/// Result of a non-blocking addressed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was queued for the peer.
    Sent,
    /// The peer's queue is full; the message was dropped.
    WouldBlock,
    /// The peer is no longer connected.
    PeerGone,
}

/// Something that happened on the publisher side of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A peer sent a message.
    Request { peer: PeerId, message: Bytes },
    /// A peer's connection closed. Its id is never reused.
    Disconnected { peer: PeerId },
}

/// Publisher side of the transport.
#[async_trait::async_trait]
pub trait ServerTransport: Send + Sync + 'static {
    /// Queue `message` for `peer` without waiting.
    fn try_send(&self, peer: PeerId, message: Bytes) -> SendOutcome;

    /// Wait for the next inbound message or disconnect.
    ///
    /// Only the request router calls this. An error means the transport can
    /// no longer receive at all.
    async fn recv(&self) -> Result<ServerEvent>;

    /// Human readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Subscriber side of the transport.
#[async_trait::async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a new connection to the publisher.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Human readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// One subscriber connection.
///
/// Dropping the connection closes it.
#[async_trait::async_trait]
pub trait Connection: Send + 'static {
    async fn send(&mut self, message: Bytes) -> Result<()>;

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns:
    /// - `Ok(Some(message))` - a message arrived
    /// - `Ok(None)` - the timeout elapsed
    /// - `Err(RelayError::ConnectionClosed)` - the publisher went away
    /// - `Err(e)` - any other transport failure
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>>;
}
