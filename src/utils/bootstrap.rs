//! Bootstrap utilities for eventwire binaries.
//!
//! Shared initialization code for the producer and consumer binaries.

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LOG_ENV_VAR};

/// Initialize tracing with EVENTWIRE_LOG environment variable.
///
/// Defaults to "info" level if EVENTWIRE_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Optional config file path: the first command-line argument.
pub fn parse_config_path() -> Option<String> {
    std::env::args().nth(1)
}

/// Initialize tracing and load configuration.
///
/// Common to both binaries.
pub fn bootstrap(binary: &str) -> Result<Config, Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        broker_type = ?config.broker.broker_type,
        address = %config.broker.address(),
        "Starting eventwire-{}",
        binary
    );
    Ok(config)
}
