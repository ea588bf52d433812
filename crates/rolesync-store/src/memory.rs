//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use rolesync_core::{ActionId, DeliveryState, FailedAction, PendingAction, ServiceKey, Time};

use crate::error::{Result, StoreError};
use crate::traits::Store;

/// In-memory store implementation. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    pending: BTreeMap<ActionId, PendingAction>,
    cursors: HashMap<ServiceKey, Time>,
    failures: Vec<FailedAction>,
    max_id: Option<ActionId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn persist_action(&self, pending: &PendingAction) -> Result<()> {
        let mut inner = self.write()?;
        inner.max_id = inner.max_id.max(Some(pending.id));
        inner.pending.insert(pending.id, pending.clone());
        Ok(())
    }

    async fn set_delivery_state(
        &self,
        id: ActionId,
        state: DeliveryState,
        attempts: u32,
    ) -> Result<()> {
        let mut inner = self.write()?;
        let entry = inner
            .pending
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.state = state;
        entry.attempts = attempts;
        Ok(())
    }

    async fn remove_action(&self, id: ActionId) -> Result<()> {
        self.write()?.pending.remove(&id);
        Ok(())
    }

    async fn load_pending(&self, key: &ServiceKey) -> Result<Vec<PendingAction>> {
        Ok(self
            .read()?
            .pending
            .values()
            .filter(|p| &p.key() == key)
            .cloned()
            .collect())
    }

    async fn load_all_pending(&self) -> Result<Vec<PendingAction>> {
        Ok(self.read()?.pending.values().cloned().collect())
    }

    async fn max_action_id(&self) -> Result<Option<ActionId>> {
        Ok(self.read()?.max_id)
    }

    async fn save_audit_cursor(&self, key: &ServiceKey, time: Time) -> Result<()> {
        self.write()?.cursors.insert(key.clone(), time);
        Ok(())
    }

    async fn load_audit_cursor(&self, key: &ServiceKey) -> Result<Time> {
        Ok(self.read()?.cursors.get(key).copied().unwrap_or(Time::ZERO))
    }

    async fn record_failure(&self, failed: &FailedAction) -> Result<()> {
        let mut inner = self.write()?;
        inner.pending.remove(&failed.id);
        inner.max_id = inner.max_id.max(Some(failed.id));
        inner.failures.push(failed.clone());
        Ok(())
    }

    async fn load_failures(&self) -> Result<Vec<FailedAction>> {
        Ok(self.read()?.failures.clone())
    }
}
