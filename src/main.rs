//! echo-server: completion-queue-driven TCP echo server.
//!
//! Loads configuration, initializes logging, and runs the dispatch loop
//! until SIGINT or SIGTERM.

use echo_ring::config::Config;
use echo_ring::runtime;
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
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        wait_timeout_ms = config.wait_timeout_ms,
        "Starting echo server"
    );

    runtime::run(config)?;
    Ok(())
}
