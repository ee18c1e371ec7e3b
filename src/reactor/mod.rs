//! Non-blocking multiplexed I/O core.
//!
//! One dispatcher thread owns the listener and every session socket,
//! multiplexing readiness through mio. Shared pieces:
//! - `Session`: per-connection state machine and buffers
//! - `SessionRegistry`: concurrent membership set for broadcasts
//! - `EventLoop`: the reactor driving accept/read/write to completion

mod event_loop;
pub mod registry;
pub mod session;

pub use event_loop::{EventLoop, ShutdownHandle};

use crate::config::Config;
use crate::reactor::registry::SessionRegistry;
use crate::relay::Relay;
use std::sync::Arc;

/// Wire the relay to a fresh registry and run the reactor until shutdown.
pub fn run(config: &Config) -> std::io::Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    let relay = Relay::new(registry);
    let mut event_loop = EventLoop::new(config, relay)?;
    event_loop.run()
}
