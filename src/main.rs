//! chat-relay: a broadcast chat relay server
//!
//! Accepts many concurrent text-chat connections and rebroadcasts each
//! received line to every other connected peer, driven by a single
//! readiness-multiplexed event loop.
//!
//! Features:
//! - Non-blocking I/O for every socket; a slow peer only backs up itself
//! - Newline-delimited message framing
//! - Voluntary disconnect via the "quit" sentinel
//! - Configuration via CLI arguments or TOML file

mod codec;
mod config;
mod reactor;
mod relay;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        "Starting chat relay"
    );

    reactor::run(&config)?;
    Ok(())
}
