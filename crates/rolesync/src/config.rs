//! Client configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use rolesync_core::HostIdentifier;
use rolesync_sync::SyncConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Configuration for a [`Client`](crate::Client).
///
/// ```json
/// {
///   "sync": { "workers": 2, "max_batch": 8 },
///   "database": "rolesync.db",
///   "hosts": { "example.net": "127.0.0.1:7400" }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Synchronizer tuning.
    pub sync: SyncConfig,
    /// SQLite database for the action queue. In memory when absent.
    pub database: Option<PathBuf>,
    /// Where each host listens.
    pub hosts: HashMap<HostIdentifier, SocketAddr>,
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if sync.workers == 0 {
            return Err(ClientError::InvalidConfig("workers must be at least 1".into()));
        }
        if sync.queue_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if sync.max_batch == 0 {
            return Err(ClientError::InvalidConfig("max_batch must be at least 1".into()));
        }
        if sync.backoff_floor_ms > sync.backoff_ceiling_ms {
            return Err(ClientError::InvalidConfig(format!(
                "backoff floor {}ms exceeds ceiling {}ms",
                sync.backoff_floor_ms, sync.backoff_ceiling_ms
            )));
        }
        Ok(())
    }
}
