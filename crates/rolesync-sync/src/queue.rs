//! The action queue: durable, per-service FIFO of internal actions.
//!
//! Every mutation is written to the store before the in-memory view changes,
//! so a store failure leaves both views agreeing and blocks that entry.
//!
//! Actions of one service are handed out strictly in enqueue order: a batch
//! is always a prefix of the service's queue, and nothing is handed out
//! while the head is in flight.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rolesync_core::{
    ActionId, DeliveryState, FailedAction, InternalAction, PendingAction, ServiceKey, Time,
};
use rolesync_store::Store;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Result;

#[derive(Default)]
struct Entries {
    pending: BTreeMap<ServiceKey, VecDeque<PendingAction>>,
    /// Keys whose redelivery waits until the given instant.
    deferred: HashMap<ServiceKey, Instant>,
}

impl Entries {
    fn find_mut(&mut self, key: &ServiceKey, id: ActionId) -> Option<&mut PendingAction> {
        self.pending
            .get_mut(key)
            .and_then(|q| q.iter_mut().find(|p| p.id == id))
    }

    fn remove(&mut self, key: &ServiceKey, id: ActionId) -> Option<PendingAction> {
        let queue = self.pending.get_mut(key)?;
        let pos = queue.iter().position(|p| p.id == id)?;
        let removed = queue.remove(pos);
        if queue.is_empty() {
            self.pending.remove(key);
            self.deferred.remove(key);
        }
        removed
    }

    fn head_is_queued(&self, key: &ServiceKey) -> bool {
        self.pending
            .get(key)
            .and_then(|q| q.front())
            .is_some_and(|p| p.state == DeliveryState::Queued)
    }
}

pub struct ActionQueue {
    store: Arc<dyn Store>,
    entries: Mutex<Entries>,
    next_id: AtomicU64,
    /// Serializes id allocation with the durable write, so ids follow
    /// enqueue order.
    enqueue_lock: tokio::sync::Mutex<()>,
    notify: Notify,
}

impl ActionQueue {
    /// Load every durable entry. Entries left in flight by a crash are
    /// queued again.
    pub async fn open(store: Arc<dyn Store>) -> Result<Self> {
        let next_id = store.max_action_id().await?.map_or(1, |id| id.0 + 1);
        let mut entries = Entries::default();
        let mut replayed = 0usize;
        for mut pending in store.load_all_pending().await? {
            if pending.state == DeliveryState::InFlight {
                store
                    .set_delivery_state(pending.id, DeliveryState::Queued, pending.attempts)
                    .await?;
                pending.state = DeliveryState::Queued;
                replayed += 1;
            }
            entries
                .pending
                .entry(pending.key())
                .or_default()
                .push_back(pending);
        }
        let total: usize = entries.pending.values().map(VecDeque::len).sum();
        if total > 0 {
            info!(total, replayed, "action queue restored");
        }
        Ok(Self {
            store,
            entries: Mutex::new(entries),
            next_id: AtomicU64::new(next_id),
            enqueue_lock: tokio::sync::Mutex::new(()),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Append an action and persist it.
    pub async fn enqueue(&self, action: InternalAction) -> Result<PendingAction> {
        let _serial = self.enqueue_lock.lock().await;
        let id = ActionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let pending = PendingAction::new(id, action, Time::now());
        self.store.persist_action(&pending).await?;
        self.lock()
            .pending
            .entry(pending.key())
            .or_default()
            .push_back(pending.clone());
        debug!(
            id = %id,
            key = %pending.key(),
            content = %pending.action.content.digest().short(),
            "enqueued"
        );
        self.notify.notify_one();
        Ok(pending)
    }

    /// Take the longest prefix of queued actions for `key` that share one
    /// subject, up to `max`, and mark them in flight.
    ///
    /// Empty when the head is already in flight.
    pub async fn dequeue_ready_batch(
        &self,
        key: &ServiceKey,
        max: usize,
    ) -> Result<Vec<PendingAction>> {
        let batch: Vec<PendingAction> = {
            let mut entries = self.lock();
            let Some(queue) = entries.pending.get_mut(key) else {
                return Ok(Vec::new());
            };
            let Some(subject) = queue
                .front()
                .filter(|p| p.state == DeliveryState::Queued)
                .map(|p| p.action.subject.clone())
            else {
                return Ok(Vec::new());
            };
            queue
                .iter_mut()
                .take_while(|p| p.state == DeliveryState::Queued && p.action.subject == subject)
                .take(max.max(1))
                .map(|p| {
                    p.state = DeliveryState::InFlight;
                    p.clone()
                })
                .collect()
        };

        for (i, pending) in batch.iter().enumerate() {
            let persisted = self
                .store
                .set_delivery_state(pending.id, DeliveryState::InFlight, pending.attempts)
                .await;
            if let Err(e) = persisted {
                let ids: Vec<ActionId> = batch.iter().map(|p| p.id).collect();
                self.revert(key, &ids, &batch[..i]).await;
                return Err(e.into());
            }
        }
        Ok(batch)
    }

    /// Undo a partially persisted dequeue.
    async fn revert(&self, key: &ServiceKey, ids: &[ActionId], persisted: &[PendingAction]) {
        for pending in persisted {
            let _ = self
                .store
                .set_delivery_state(pending.id, DeliveryState::Queued, pending.attempts)
                .await;
        }
        let mut entries = self.lock();
        for id in ids {
            if let Some(p) = entries.find_mut(key, *id) {
                p.state = DeliveryState::Queued;
            }
        }
    }

    /// Remove a delivered action.
    pub async fn acknowledge(&self, key: &ServiceKey, id: ActionId) -> Result<Option<PendingAction>> {
        self.store.remove_action(id).await?;
        let removed = self.lock().remove(key, id);
        if removed.is_some() {
            debug!(id = %id, %key, "acknowledged");
            self.notify.notify_one();
        }
        Ok(removed)
    }

    /// Put an in-flight action back after a failed delivery attempt.
    ///
    /// Returns the new attempt count.
    pub async fn requeue(&self, key: &ServiceKey, id: ActionId) -> Result<u32> {
        let attempts = match self.lock().find_mut(key, id) {
            Some(p) => p.attempts + 1,
            None => return Ok(0),
        };
        self.store
            .set_delivery_state(id, DeliveryState::Queued, attempts)
            .await?;
        if let Some(p) = self.lock().find_mut(key, id) {
            p.state = DeliveryState::Queued;
            p.attempts = attempts;
        }
        Ok(attempts)
    }

    /// Put in-flight actions back without counting an attempt, e.g. when
    /// their sender never ran or stopped early.
    ///
    /// The in-memory entries are released even if persisting fails: an
    /// action stored as in flight is replayed as queued on the next open.
    pub async fn release(&self, key: &ServiceKey, ids: &[ActionId]) -> Result<()> {
        let mut released = Vec::with_capacity(ids.len());
        {
            let mut entries = self.lock();
            for id in ids {
                if let Some(p) = entries.find_mut(key, *id) {
                    if p.state == DeliveryState::InFlight {
                        p.state = DeliveryState::Queued;
                        released.push((p.id, p.attempts));
                    }
                }
            }
        }
        self.notify.notify_one();
        let mut result = Ok(());
        for (id, attempts) in released {
            let persisted = self
                .store
                .set_delivery_state(id, DeliveryState::Queued, attempts)
                .await;
            if let Err(e) = persisted {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }

    /// Give up on an action and record why.
    pub async fn fail(
        &self,
        key: &ServiceKey,
        id: ActionId,
        reason: impl Into<String>,
    ) -> Result<Option<FailedAction>> {
        let Some(pending) = self.lock().find_mut(key, id).map(|p| p.clone()) else {
            return Ok(None);
        };
        let failed = FailedAction {
            id,
            action: pending.action,
            failed_at: Time::now(),
            reason: reason.into(),
        };
        self.store.record_failure(&failed).await?;
        self.lock().remove(key, id);
        info!(id = %id, %key, reason = %failed.reason, "action failed");
        self.notify.notify_one();
        Ok(Some(failed))
    }

    /// The most recently enqueued action of `key`.
    pub fn peek_last(&self, key: &ServiceKey) -> Option<PendingAction> {
        self.lock().pending.get(key).and_then(|q| q.back().cloned())
    }

    pub fn head(&self, key: &ServiceKey) -> Option<PendingAction> {
        self.lock().pending.get(key).and_then(|q| q.front().cloned())
    }

    /// Every pending action of `key`, in enqueue order.
    pub fn pending(&self, key: &ServiceKey) -> Vec<PendingAction> {
        self.lock()
            .pending
            .get(key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pending actions of `key` enqueued after `cursor`, in enqueue order.
    pub fn pending_after(&self, key: &ServiceKey, cursor: Time) -> Vec<PendingAction> {
        self.lock()
            .pending
            .get(key)
            .map(|q| q.iter().filter(|p| p.enqueued_at > cursor).cloned().collect())
            .unwrap_or_default()
    }

    /// Keys with a queued head that is not deferred past `now`.
    pub fn ready_keys(&self, now: Instant) -> Vec<ServiceKey> {
        let mut entries = self.lock();
        entries.deferred.retain(|_, until| *until > now);
        let entries = &*entries;
        entries
            .pending
            .keys()
            .filter(|k| !entries.deferred.contains_key(*k) && entries.head_is_queued(k))
            .cloned()
            .collect()
    }

    /// Hold back `key` until `until`.
    pub fn defer(&self, key: &ServiceKey, until: Instant) {
        self.lock().deferred.insert(key.clone(), until);
        self.notify.notify_one();
    }

    /// Earliest instant a deferred key with a queued head becomes ready.
    pub fn next_deferral(&self) -> Option<Instant> {
        let entries = self.lock();
        entries
            .deferred
            .iter()
            .filter(|(k, _)| entries.head_is_queued(k))
            .map(|(_, until)| *until)
            .min()
    }

    /// Resolves after the next change that may make a batch ready.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_core::{ContentBlock, Effect, Identifier, RoleId, TypeIdentifier};
    use rolesync_store::{MemoryStore, SqliteStore};
    use std::time::Duration;

    fn service() -> TypeIdentifier {
        TypeIdentifier::from_static("notes@test")
    }

    fn key() -> ServiceKey {
        ServiceKey::new(RoleId(1), service())
    }

    fn action(subject: &str, payload: &'static [u8]) -> InternalAction {
        InternalAction::new(
            RoleId(1),
            Identifier::new(subject).unwrap(),
            service(),
            ContentBlock::new(TypeIdentifier::from_static("note@test"), payload),
            Effect::HostAssigned,
        )
    }

    async fn queue() -> ActionQueue {
        ActionQueue::open(Arc::new(MemoryStore::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_batch_is_ordered_prefix() {
        let q = queue().await;
        let a = q.enqueue(action("alice@h.test", b"a")).await.unwrap();
        let b = q.enqueue(action("alice@h.test", b"b")).await.unwrap();
        let c = q.enqueue(action("alice@h.test", b"c")).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);

        let batch = q.dequeue_ready_batch(&key(), 2).await.unwrap();
        assert_eq!(batch.iter().map(|p| p.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert!(batch.iter().all(|p| p.state == DeliveryState::InFlight));

        // Head in flight: nothing else goes out, not even c.
        assert!(q.dequeue_ready_batch(&key(), 10).await.unwrap().is_empty());
        assert!(q.ready_keys(Instant::now()).is_empty());

        q.acknowledge(&key(), a.id).await.unwrap();
        q.acknowledge(&key(), b.id).await.unwrap();
        let batch = q.dequeue_ready_batch(&key(), 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, c.id);
    }

    #[tokio::test]
    async fn test_batch_stops_at_subject_change() {
        let q = queue().await;
        q.enqueue(action("alice@h.test", b"a")).await.unwrap();
        q.enqueue(action("bob@h.test", b"b")).await.unwrap();
        q.enqueue(action("alice@h.test", b"c")).await.unwrap();
        assert_eq!(q.dequeue_ready_batch(&key(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_counts_attempts() {
        let q = queue().await;
        let a = q.enqueue(action("alice@h.test", b"a")).await.unwrap();
        q.dequeue_ready_batch(&key(), 1).await.unwrap();
        assert_eq!(q.requeue(&key(), a.id).await.unwrap(), 1);
        q.dequeue_ready_batch(&key(), 1).await.unwrap();
        assert_eq!(q.requeue(&key(), a.id).await.unwrap(), 2);

        q.dequeue_ready_batch(&key(), 1).await.unwrap();
        q.release(&key(), &[a.id]).await.unwrap();
        let head = q.head(&key()).unwrap();
        assert_eq!(head.state, DeliveryState::Queued);
        assert_eq!(head.attempts, 2);
    }

    #[tokio::test]
    async fn test_fail_records_and_removes() {
        let store = Arc::new(MemoryStore::new());
        let q = ActionQueue::open(store.clone()).await.unwrap();
        let a = q.enqueue(action("alice@h.test", b"a")).await.unwrap();
        let failed = q.fail(&key(), a.id, "rejected").await.unwrap().unwrap();
        assert_eq!(failed.reason, "rejected");
        assert!(q.is_empty());
        assert_eq!(store.load_failures().await.unwrap().len(), 1);
        assert!(store.load_all_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deferral() {
        let q = queue().await;
        q.enqueue(action("alice@h.test", b"a")).await.unwrap();
        let now = Instant::now();
        q.defer(&key(), now + Duration::from_secs(5));
        assert!(q.ready_keys(now).is_empty());
        assert_eq!(q.next_deferral(), Some(now + Duration::from_secs(5)));
        assert_eq!(q.ready_keys(now + Duration::from_secs(6)), vec![key()]);
        assert_eq!(q.next_deferral(), None);
    }

    #[tokio::test]
    async fn test_peek_and_pending_after() {
        let q = queue().await;
        assert!(q.peek_last(&key()).is_none());
        let a = q.enqueue(action("alice@h.test", b"a")).await.unwrap();
        let b = q.enqueue(action("alice@h.test", b"b")).await.unwrap();
        assert_eq!(q.peek_last(&key()).unwrap().id, b.id);
        assert_eq!(q.pending(&key()).len(), 2);
        assert_eq!(q.pending_after(&key(), Time::ZERO).len(), 2);
        assert!(q
            .pending_after(&key(), Time(b.enqueued_at.0.max(a.enqueued_at.0)))
            .is_empty());
    }

    #[tokio::test]
    async fn test_replay_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        let (a, b) = {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            let q = ActionQueue::open(store).await.unwrap();
            let a = q.enqueue(action("alice@h.test", b"a")).await.unwrap();
            let b = q.enqueue(action("alice@h.test", b"b")).await.unwrap();
            q.dequeue_ready_batch(&key(), 1).await.unwrap();
            (a, b)
        };

        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let q = ActionQueue::open(store).await.unwrap();
        let pending = q.pending(&key());
        assert_eq!(pending.iter().map(|p| p.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert!(pending.iter().all(|p| p.state == DeliveryState::Queued));

        let c = q.enqueue(action("alice@h.test", b"c")).await.unwrap();
        assert!(c.id > b.id);
    }
}
