//! Beacon - standalone signaling server
//!
//! Binds a TCP listener, hosts the signaling hub, and runs until
//! interrupted. Takes an optional path to a TOML config file as its
//! first argument.

use std::net::SocketAddr;
use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beacon_net::Server;

mod config;

use config::ServerConfig;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting Beacon");

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to load config from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    let addr: SocketAddr = match config.listen_addr().parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid listen address {}: {}", config.listen_addr(), e);
            std::process::exit(1);
        }
    };

    let server = match Server::start(addr, config.hub_config()).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %server.addr(), "Beacon listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutdown signal received");
    server.shutdown();
}
