//! Tracing setup.

use tracing_subscriber::EnvFilter;

use crate::error::{ClientError, Result};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| ClientError::Tracing(e.to_string()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| ClientError::Tracing(e.to_string()))
}
