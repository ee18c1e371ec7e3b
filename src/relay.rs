//! Broadcast policy.
//!
//! The relay decides who a message goes to and what the wire line looks like;
//! the reactor decides when sockets are ready. Delivery is fire-and-forget
//! per peer: one broken or backed-up peer never blocks the rest of a
//! broadcast, it just gets reported for teardown.

use crate::reactor::registry::SessionRegistry;
use crate::reactor::session::{Session, SessionId};
use slab::Slab;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

/// Literal message that ends a session voluntarily. Exact match, no
/// whitespace tolerance.
pub const QUIT_SENTINEL: &str = "quit";

/// Whether a decoded message is the quit sentinel.
pub fn is_quit(message: &str) -> bool {
    message == QUIT_SENTINEL
}

/// A planned broadcast: the formatted line and who receives it.
#[derive(Debug)]
pub struct Dispatch {
    /// `"<sender-name>: <message>\n"`.
    pub payload: Vec<u8>,
    /// Every registered session except the sender, at snapshot time.
    pub targets: Vec<SessionId>,
    /// The sender asked to disconnect; tear it down after delivery so peers
    /// see its final line first.
    pub hangup: bool,
}

/// Per-peer outcome of a delivery pass.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Peers left with queued bytes; the reactor arms write interest.
    pub pending: Vec<SessionId>,
    /// Peers whose write failed or overflowed; the reactor tears them down.
    pub failed: Vec<SessionId>,
}

/// Stateless-per-message broadcast policy over a shared registry.
pub struct Relay {
    registry: Arc<SessionRegistry>,
}

impl Relay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Plan the broadcast of one decoded message.
    ///
    /// The target list comes from a registry snapshot taken before any
    /// teardown, so a quitting sender's final line still reaches everyone.
    pub fn dispatch(&self, sender: SessionId, sender_name: &str, message: &str) -> Dispatch {
        let payload = format!("{sender_name}: {message}\n").into_bytes();
        let targets = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|(id, _)| (id != sender).then_some(id))
            .collect();

        Dispatch {
            payload,
            targets,
            hangup: is_quit(message),
        }
    }

    /// Write the payload to every target, isolating per-peer failures.
    pub fn deliver<T: Read + Write>(
        &self,
        dispatch: &Dispatch,
        sessions: &mut Slab<Session<T>>,
    ) -> Delivery {
        let mut delivery = Delivery::default();

        for &id in &dispatch.targets {
            let Some(peer) = sessions.get_mut(id) else {
                // Torn down between snapshot and delivery
                debug!(conn_id = id, "Broadcast target already gone");
                continue;
            };

            if let Err(e) = peer.queue(&dispatch.payload) {
                warn!(conn_id = id, peer = peer.name(), error = %e, "Dropping slow peer");
                delivery.failed.push(id);
                continue;
            }

            match peer.flush() {
                Ok(true) => {}
                Ok(false) => delivery.pending.push(id),
                Err(e) => {
                    warn!(conn_id = id, peer = peer.name(), error = %e, "Broadcast write failed");
                    delivery.failed.push(id);
                }
            }
        }

        delivery
    }
}
