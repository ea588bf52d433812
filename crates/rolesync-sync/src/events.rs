//! Events emitted by the synchronizer.
//!
//! State changes are reported as values on a broadcast channel instead of
//! callbacks, so observers never run inside the operation that caused them.

use std::time::Duration;

use rolesync_core::{ActionId, ServiceKey, Time};
use tokio::sync::broadcast;

use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Queued {
        key: ServiceKey,
        id: ActionId,
    },
    Delivered {
        key: ServiceKey,
        id: ActionId,
    },
    /// The action will not be delivered. It was recorded in the store.
    Failed {
        key: ServiceKey,
        id: ActionId,
        kind: ErrorKind,
        reason: String,
    },
    AuditApplied {
        key: ServiceKey,
        cursor: Time,
        events: usize,
    },
    Suspended {
        key: ServiceKey,
    },
    Resumed {
        key: ServiceKey,
    },
    /// Local state of the service may have diverged from the host.
    ReloadRequired {
        key: ServiceKey,
    },
    /// A sender stopped on a local error. Its undelivered actions are queued
    /// again and `key` is retried after `delay`.
    Stalled {
        key: ServiceKey,
        reason: String,
        delay: Duration,
    },
    /// The worker pool was full; dispatch sleeps for `delay`.
    CapacityBackoff {
        delay: Duration,
    },
    ShutDown,
}

/// Sending half of the event channel. Emitting with no subscriber is fine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::ShutDown);

        let mut rx = bus.subscribe();
        bus.emit(SyncEvent::ShutDown);
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::ShutDown);
    }
}
