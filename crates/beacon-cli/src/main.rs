//! # Beacon
//!
//! Command line client for Phoenix-style channel servers.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file in the working directory
//! beacon
//!
//! # Run with a specific config file
//! BEACON_CONFIG=/path/to/beacon.toml beacon
//!
//! # Run with environment variables
//! BEACON_URL=wss://example.com/socket/websocket BEACON_TOKEN=secret beacon
//! ```

mod config;
mod metrics;
mod session;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Beacon against {}", config.url);

    // Initialize metrics
    metrics::init_metrics();

    session::run(config).await?;

    Ok(())
}
