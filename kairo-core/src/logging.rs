//! Tracing subscriber setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{KairoError, KairoResult};

/// Builds the filter for a logging config. `RUST_LOG` wins over the
/// configured level when it is set.
pub fn build_filter(config: &LoggingConfig) -> KairoResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(&config.level).map_err(|e| KairoError::InvalidConfigValue {
        key: "logging.level".to_string(),
        message: e.to_string(),
    })
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LoggingConfig) -> KairoResult<()> {
    let filter = build_filter(config)?;

    let output = if config.json_format {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| KairoError::Internal(format!("Failed to install tracing subscriber: {}", e)))
}
