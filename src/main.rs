//! echo-chamber: a marker-prefixed TCP echo server
//!
//! A single thread multiplexes one listening socket and any number of
//! client connections through a readiness poll. Every chunk a client
//! sends comes back prefixed with `"you sent: "`; a SIGINT or SIGTERM
//! closes every connection in arrival order and exits cleanly.

mod config;
mod runtime;
mod signal;

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
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        chunk_size = config.chunk_size,
        "Starting echo-chamber server"
    );

    let bound = runtime::acquire(&config.host, config.port, config.backlog)?;
    let event_loop = runtime::EventLoop::new(bound, config.chunk_size)?;

    // The interrupt handler only touches the shutdown handle; the loop
    // notices the request between readiness rounds.
    signal::install(event_loop.shutdown_handle())?;

    event_loop.run()?;
    Ok(())
}
