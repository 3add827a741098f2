use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;

/// Initializes the global tracing subscriber from configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Safe to call
/// once per process; returns quietly if a subscriber is already set.
pub fn init(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let result = if config.log_json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init()
    } else {
        fmt().with_env_filter(filter).try_init()
    };

    if let Err(err) = result {
        tracing::debug!("tracing subscriber already installed: {err}");
    }
}
