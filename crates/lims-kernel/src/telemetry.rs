//! Tracing setup

use crate::config::LogConfig;
use crate::error::LimsError;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` wins over `config.filter` when set.
///
/// # Errors
/// [`LimsError::Config`] for an invalid filter or when a subscriber is
/// already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), LimsError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| LimsError::Config(e.to_string()))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| LimsError::Config(e.to_string()))
}
