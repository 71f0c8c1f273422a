//! # Tether Server
//!
//! Serves the rooms listed in the configuration over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (one room at /ws)
//! tether
//!
//! # Run with environment variables
//! TETHER_PORT=9000 TETHER_HOST=0.0.0.0 tether
//! ```

use anyhow::{Context, Result};
use tether_server::{metrics, Config, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    config.validate()?;

    tracing::info!("Starting tether server on {}:{}", config.host, config.port);

    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    let server = Server::new(config.server_options()?, None);
    for entry in &config.rooms {
        let room = server
            .register_path(entry.path.clone(), config.room_config(entry))
            .with_context(|| format!("Failed to register room at {}", entry.path))?;
        tracing::info!(path = %entry.path, room = %room.id(), echo = entry.echo, "Room ready");
    }

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.stop();
        }
    });

    server.run().await?;
    Ok(())
}
