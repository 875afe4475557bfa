//! Request router.
//!
//! The router is the only reader of the server transport. Every inbound
//! message is a stream name; the router arms the sender for that stream and
//! does nothing else, so it never waits on an engine. Closed connections are
//! evicted from the demand table here as well.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::Result;
use crate::demand::DemandTable;
use crate::transport::{ServerEvent, ServerTransport};

/// Counters collected by the request router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub requests: u64,
    /// Requests that were not a valid stream name.
    pub rejected: u64,
    /// Closed subscriber connections.
    pub disconnects: u64,
}

/// Extract the requested stream name from a request message.
///
/// Trailing nulls are tolerated. Returns `None` for empty or non UTF-8
/// requests.
pub fn parse_request(message: &[u8]) -> Option<&str> {
    let name = std::str::from_utf8(message).ok()?.trim_end_matches('\0');
    if name.is_empty() { None } else { Some(name) }
}

/// Arm subscribers as their requests arrive, until `cancel` fires.
///
/// A receive error is fatal unless shutdown is already in progress.
pub async fn run_router<T: ServerTransport>(
    transport: Arc<T>,
    demand: Arc<DemandTable>,
    cancel: CancellationToken,
) -> Result<RouterStats> {
    info!(endpoint = %transport.endpoint(), "Request router started");
    let mut stats = RouterStats::default();

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.recv() => received,
        };

        match received {
            Ok(ServerEvent::Disconnected { peer }) => {
                stats.disconnects += 1;
                let known = demand.evict(peer);
                debug!(peer, known, "Subscriber connection closed");
            }
            Ok(ServerEvent::Request { peer, message }) => {
                stats.requests += 1;
                match parse_request(&message) {
                    Some(stream) => {
                        trace!(peer, stream, "Frame requested");
                        demand.mark_pending(peer, stream);
                    }
                    None => {
                        stats.rejected += 1;
                        warn!(peer, len = message.len(), "Ignoring malformed request");
                    }
                }
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    debug!(error = %e, "Receive failed during shutdown");
                    break;
                }
                error!(error = %e, "Request router failed");
                return Err(e);
            }
        }
    }

    info!(requests = stats.requests, "Request router stopped");
    Ok(stats)
}
