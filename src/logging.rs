//! Logging Module
//!
//! Initializes the tracing subscriber for the gateway. `RUST_LOG` overrides
//! the configured default level.

use crate::config::LoggingConfig;
use crate::{GatewayError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Call once at startup.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| GatewayError::Config(format!("invalid log level {}: {}", config.level, e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| GatewayError::Internal(format!("failed to init logging: {}", e)))?;

    Ok(())
}
