//! mastertrade - headless trading control plane.
//!
//! Runs the strategy lifecycle engine, risk decision core, arbitrage
//! monitor, and order gateway as one process. Metrics are pushed as
//! structured JSON lines to stdout - no HTTP server, no incoming
//! connections.
//!
//! # Usage
//! ```sh
//! MODE=mock cargo run
//! ```
//!
//! # Environment Variables
//! - `MODE` - `mock` (simulated venues) or `live` (default: mock)
//! - `DATABASE_URL` - SQLite URL in live mode
//! - `SYMBOLS` - comma-separated watchlist (default: BTC/USDT,ETH/USDT)
//! - `OBSERVABILITY_INTERVAL` - seconds between metric lines (default: 60)

use anyhow::Result;
use mastertrade::application::system::Application;
use mastertrade::config::Config;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("mastertrade {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: mode={:?}, symbols={:?}",
        config.mode, config.symbols
    );

    let app = Application::build(config).await?;
    let handle = app.start().await?;

    info!("System running. Press Ctrl+C to shutdown.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping services...");
    handle.shutdown();

    // Give loops a moment to observe the flag and unwind.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    info!("Goodbye.");
    Ok(())
}
