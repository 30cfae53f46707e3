//! manykv - serve one in-memory key-value store to guests over TCP.

use manykv_host::{Config, Host, HostError, Server};
use manykv_storage::MemoryStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), HostError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if MANYKV_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var("MANYKV_CONFIG") {
        tracing::info!("Loaded config from {}", path);
    }

    tracing::info!("Starting manykv host");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!("  Read-only: {}", config.host.readonly);
    tracing::info!(
        "  Write high-water mark: {} bytes",
        config.host.write_high_water_mark
    );

    let host = Host::new(Arc::new(MemoryStore::new()), config.host_options());
    let server = Arc::new(Server::new(config.server_config(), host));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Blocks until shutdown
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
