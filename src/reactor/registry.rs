//! Concurrent registry of broadcast-visible sessions.
//!
//! Membership is the single piece of state shared beyond the dispatcher, so
//! it gets an explicit concurrency discipline: one mutex around a plain map,
//! every operation a single short critical section. Broadcasts never iterate
//! the live map; they take a point-in-time snapshot.

use crate::reactor::session::SessionId;
use std::collections::HashMap;
use std::sync::Mutex;

/// What a broadcast needs to know about a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub name: String,
}

/// Set of live sessions keyed by id.
///
/// A session appears here iff it is `Established` or `Closing`; teardown
/// removes it before the state reaches `Closed`. `add` and `remove` are both
/// idempotent, and `snapshot` is copy-on-read so concurrent mutation cannot
/// corrupt an iteration.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: Mutex<HashMap<SessionId, PeerEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. Re-adding an existing id keeps the original entry.
    pub fn add(&self, id: SessionId, name: &str) {
        self.peers
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| PeerEntry {
                name: name.to_string(),
            });
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub fn remove(&self, id: SessionId) -> Option<PeerEntry> {
        self.peers.lock().unwrap().remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.peers.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time view of the membership, in no particular order.
    pub fn snapshot(&self) -> Vec<(SessionId, PeerEntry)> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(&id, entry)| (id, entry.clone()))
            .collect()
    }
}
