//! Tracing subscriber setup.
//!
//! Call [`init`] once at startup; library code only emits `tracing` events
//! and never installs a subscriber itself.

use tracing_subscriber::{fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer as _};

use crate::utils::config::LoggingConfig;
use crate::utils::error::{TabulaError, TabulaResult};

/// Build the filter: `RUST_LOG` wins, then the configured directive
pub fn build_filter(config: &LoggingConfig) -> TabulaResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| TabulaError::Configuration(format!("Invalid log filter '{}': {}", config.filter, e)))
}

/// Install the global subscriber, writing to stderr
///
/// # Errors
///
/// Fails if the filter directive is invalid or a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> TabulaResult<()> {
    let env_filter = build_filter(config)?;

    let fmt_layer = if config.json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| TabulaError::Configuration(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(filter = %config.filter, json = config.json, "Logging initialized");
    Ok(())
}
