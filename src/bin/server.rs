//! hashload-server: hashes client payloads on a fixed worker pool
//!
//! Usage: hashload-server <port> <pool-size> [--config FILE]

use hashload::config::ServerConfig;
use hashload::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        pool_size = config.pool_size,
        max_connections = config.max_connections,
        stats_interval = config.stats_interval,
        "Starting hashload server"
    );

    let server = Server::bind(&config)?;
    server.run()?;
    Ok(())
}
