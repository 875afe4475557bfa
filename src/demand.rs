//! Subscriber demand tracking.
//!
//! The demand table records which subscribers asked for the next frame of
//! which stream. The request router arms entries as requests arrive and every
//! publisher engine takes the armed subscribers of its own stream when a new
//! frame is ready. The lock is held only for the map manipulation itself,
//! never across a send or an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use crate::transport::PeerId;

type Entries = HashMap<PeerId, HashMap<String, bool>>;

/// Concurrent map from (peer, stream) to a pending-request flag.
#[derive(Debug, Default)]
pub struct DemandTable {
    entries: Mutex<Entries>,
}

impl DemandTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // A panic elsewhere cannot leave the map half-updated, every
        // operation is a single insert or remove.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm `peer` for the next frame of `stream`.
    ///
    /// Arming an already armed peer is a no-op, so a peer never has more than
    /// one outstanding request per stream.
    pub fn mark_pending(&self, peer: PeerId, stream: &str) {
        let mut entries = self.lock();
        let streams = entries.entry(peer).or_default();
        match streams.get_mut(stream) {
            Some(armed) => *armed = true,
            None => {
                streams.insert(stream.to_string(), true);
            }
        }
        trace!(peer, stream, "Subscriber armed");
    }

    /// Return and disarm every peer armed for `stream`.
    pub fn take_pending(&self, stream: &str) -> Vec<PeerId> {
        let mut entries = self.lock();
        let mut taken = Vec::new();
        for (peer, streams) in entries.iter_mut() {
            if let Some(armed) = streams.get_mut(stream) {
                if *armed {
                    *armed = false;
                    taken.push(*peer);
                }
            }
        }
        taken
    }

    /// Disarm one peer for one stream.
    pub fn clear_one(&self, peer: PeerId, stream: &str) {
        if let Some(armed) = self.lock().get_mut(&peer).and_then(|s| s.get_mut(stream)) {
            *armed = false;
        }
    }

    /// Forget everything about `peer`.
    ///
    /// Returns whether the peer was known.
    pub fn evict(&self, peer: PeerId) -> bool {
        self.lock().remove(&peer).is_some()
    }

    pub fn is_pending(&self, peer: PeerId, stream: &str) -> bool {
        self.lock().get(&peer).and_then(|s| s.get(stream)).copied().unwrap_or(false)
    }

    /// Number of peers with at least one entry, armed or not.
    pub fn peer_count(&self) -> usize {
        self.lock().len()
    }
}
