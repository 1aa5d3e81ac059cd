//! hashload-client: drives many connections at a fixed message rate
//!
//! Usage: hashload-client <server-host> <server-port> <rate> [-n CONNECTIONS]

use hashload::client::Client;
use hashload::config::ClientConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ClientConfig::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        server = %format!("{}:{}", config.server_host, config.server_port),
        rate = config.rate,
        connections = config.connections,
        messages = ?config.messages,
        "Starting hashload client"
    );

    let client = Client::connect(&config)?;
    client.run()?;
    Ok(())
}
