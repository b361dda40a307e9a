//! # Herald CLI
//!
//! Connects to a Herald service, subscribes to channels and logs every event.
//!
//! ## Usage
//!
//! ```bash
//! # Use herald.toml from the usual locations
//! herald
//!
//! # Run with a custom config
//! herald --config /path/to/herald.toml
//!
//! # Override settings through the environment
//! HERALD_CLIENT__APP_KEY=app HERALD_CHANNELS=orders,news herald
//! ```

mod config;
mod metrics;
mod run;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "herald")]
#[command(about = "Subscribe to Herald channels and log what arrives")]
struct Cli {
    /// Path to a configuration file, replacing the default search
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra channel to subscribe to (repeatable)
    #[arg(long = "channel", value_name = "NAME")]
    channels: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=info,herald_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = config::CliConfig::load(cli.config.as_deref())?;
    config.add_channels(cli.channels);

    tracing::info!(
        host = %config.client.resolved_host(),
        channels = config.channels.len(),
        "Starting Herald client"
    );

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("{:#}", e);
        }
    }

    run::run(config).await
}
