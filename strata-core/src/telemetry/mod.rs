//! Tracing subscriber setup.
//!
//! Components log through the `tracing` macros; embedders that already own a
//! subscriber can skip [`init_tracing`] entirely.

use crate::{
    config::{LogFormat, LoggingConfig},
    Error, Result,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Build the filter: `RUST_LOG` wins over the configured level.
///
/// # Errors
/// Returns [`Error::Configuration`] if the configured directive is invalid.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| Error::Configuration {
        message: format!("Invalid log level '{}': {e}", config.level),
    })
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, so tests and
/// embedders may call this more than once.
///
/// # Errors
/// Returns [`Error::Configuration`] if the level directive is invalid.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    let filter = env_filter(config)?;

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .with_filter(filter)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(config.ansi)
            .with_filter(filter)
            .boxed(),
    };

    Ok(tracing_subscriber::registry().with(fmt_layer).try_init().is_ok())
}
