//! # Spjall Server
//!
//! Realtime chat server speaking WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! spjall
//!
//! # Run with custom config
//! spjall --config /path/to/spjall.toml
//!
//! # Run with environment variables
//! SPJALL_PORT=8080 SPJALL_HOST=0.0.0.0 APP_URL=https://chat.example spjall
//! ```

use anyhow::Result;
use clap::Parser;
use spjall_server::{config::Config, metrics, run_server, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "spjall=debug,spjall_core=debug,spjall_server=debug,spjall_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load(cli.config)?;

    tracing::info!("Starting Spjall server on {}:{}", config.host, config.port);
    if config.users.is_empty() {
        tracing::warn!("No users configured; every auth attempt will fail");
    }

    // Initialize metrics
    metrics::init_metrics();

    run_server(config).await
}
