//! Synchronizer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs of the synchronizer.
///
/// Every field has a default, so a partial JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Worker tasks running senders.
    pub workers: usize,
    /// Sender tasks that may wait for a worker before submissions are rejected.
    pub queue_capacity: usize,
    /// Dispatch backoff floor, in milliseconds.
    pub backoff_floor_ms: u64,
    /// Dispatch backoff ceiling, in milliseconds.
    pub backoff_ceiling_ms: u64,
    /// Most actions sent in one envelope.
    pub max_batch: usize,
    /// Resends one exchange may make for key rotation or relocation.
    pub max_iterations: u32,
    /// Failed deliveries before an action is given up.
    pub max_delivery_attempts: u32,
    /// Connect and I/O timeout, in milliseconds.
    pub io_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 16,
            backoff_floor_ms: 100,
            backoff_ceiling_ms: 30_000,
            max_batch: 32,
            max_iterations: 3,
            max_delivery_attempts: 5,
            io_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn backoff_floor(&self) -> Duration {
        Duration::from_millis(self.backoff_floor_ms)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms.max(self.backoff_floor_ms))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"workers": 2, "max_batch": 8}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_batch, 8);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.max_delivery_attempts, 5);
    }

    #[test]
    fn test_ceiling_never_below_floor() {
        let config = SyncConfig {
            backoff_floor_ms: 500,
            backoff_ceiling_ms: 100,
            ..SyncConfig::default()
        };
        assert_eq!(config.backoff_ceiling(), Duration::from_millis(500));
    }
}
