//! Tracing initialization.

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initializes a JSON-formatted `tracing` subscriber at the level named by
/// `config.service.log_level`, falling back to `info` if it doesn't parse.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("tracing initialized for service: {}", config.service.name);

    Ok(())
}
