//! Market data collector entry point.
//!
//! Ingests exchange WebSocket streams, normalizes them and dispatches to
//! pub/sub, the in-memory cache and the browser fan-out proxy.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Market data collector
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via MARKETFLOW_CONFIG)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize TLS crypto provider (must be before any WS connections)
    marketflow_ws::init_crypto();

    let args = Args::parse();

    marketflow_telemetry::init_logging()?;

    info!("Starting marketflow collector v{}", env!("CARGO_PKG_VERSION"));

    // Config path: CLI arg > MARKETFLOW_CONFIG env var > default.
    let config_path = args
        .config
        .or_else(|| std::env::var("MARKETFLOW_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());
    info!(config_path = %config_path, "Loading configuration");

    let config = marketflow_collector::CollectorConfig::load(&config_path)?;
    info!(
        adapters = config.adapters.len(),
        routes = config.routes.len(),
        "Configuration loaded"
    );

    let mut app = marketflow_collector::Application::new(config);
    app.run().await?;

    Ok(())
}
