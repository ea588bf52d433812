//! The synchronizer: queues internal actions, dispatches them to hosts and
//! reconciles local state.
//!
//! Each `(role, service)` key is either active or suspended. A suspension
//! is an exclusive hold on the key's gate: it waits for the key's in-flight
//! sender to finish, keeps new senders and `execute` calls out, and a
//! second suspension of the same key waits until the first resumes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rolesync_core::{
    ActionId, Audit, Identifier, InternalAction, Role, RoleId, ServiceKey, Time, TypeIdentifier,
};
use tokio::sync::{broadcast, watch, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{apply_audit, AuditMode, AuditOutcome};
use crate::collaborators::Authorizer;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::exchange::{Exchange, Response};
use crate::method::{ExternalAction, Method, Outcome, Query, Reply};
use crate::pool::{Backoff, Rejected, WorkerPool};
use crate::protocol::{AuditQuery, StateQuery, StateReply};
use crate::queue::ActionQueue;
use crate::registry::ServiceRegistry;
use crate::sender::{Sender, SyncContext};

impl SyncContext {
    pub fn new(
        queue: ActionQueue,
        exchange: Exchange,
        registry: ServiceRegistry,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            exchange: exchange.with_max_iterations(config.max_iterations),
            registry,
            events: EventBus::default(),
            config,
        }
    }
}

/// Per-key gates. Entries are created on first use and never removed.
#[derive(Default)]
struct Suspensions {
    gates: Mutex<HashMap<ServiceKey, Arc<RwLock<()>>>>,
    suspended: Mutex<HashSet<ServiceKey>>,
}

impl Suspensions {
    fn gate(&self, key: &ServiceKey) -> Arc<RwLock<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(key.clone()).or_default())
    }

    fn suspended(&self) -> MutexGuard<'_, HashSet<ServiceKey>> {
        self.suspended.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to one key. Resumes the key when dropped.
pub struct SuspensionGuard {
    key: ServiceKey,
    suspensions: Arc<Suspensions>,
    ctx: Arc<SyncContext>,
    _gate: OwnedRwLockWriteGuard<()>,
}

impl SuspensionGuard {
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn resume(self) {}
}

impl Drop for SuspensionGuard {
    fn drop(&mut self) {
        self.suspensions.suspended().remove(&self.key);
        debug!(key = %self.key, "resumed");
        self.ctx.events.emit(SyncEvent::Resumed {
            key: self.key.clone(),
        });
        self.ctx.queue.wake();
    }
}

/// Result of a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    /// Cursor of the loaded snapshot.
    pub cursor: Time,
    /// Queued actions the snapshot already contained.
    pub acknowledged: Vec<ActionId>,
    /// Actions executed again on top of the snapshot, in enqueue order.
    pub redone: Vec<ActionId>,
    /// Actions still waiting for delivery, in enqueue order.
    pub pending: Vec<ActionId>,
}

pub struct Synchronizer {
    ctx: Arc<SyncContext>,
    authorizer: Arc<dyn Authorizer>,
    pool: Arc<WorkerPool>,
    suspensions: Arc<Suspensions>,
    shutdown: watch::Sender<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Synchronizer {
    /// Must be called inside a tokio runtime: the worker pool starts here.
    pub fn new(ctx: SyncContext, authorizer: Arc<dyn Authorizer>) -> Self {
        let pool = WorkerPool::new(ctx.config.workers, ctx.config.queue_capacity);
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(ctx),
            authorizer,
            pool: Arc::new(pool),
            suspensions: Arc::new(Suspensions::default()),
            shutdown,
            dispatch: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    /// Start the dispatch loop. Calling it again does nothing.
    pub fn start(&self) {
        let mut dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        if dispatch.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let dispatcher = Dispatcher {
            ctx: Arc::clone(&self.ctx),
            pool: Arc::clone(&self.pool),
            suspensions: Arc::clone(&self.suspensions),
            shutdown: self.shutdown.subscribe(),
        };
        *dispatch = Some(tokio::spawn(dispatcher.run()));
    }

    /// Queue an internal action for delivery.
    ///
    /// Actions whose local effect equals their remote effect are executed
    /// locally before this returns; the others once their reply arrives.
    /// A failed local execution leaves nothing queued.
    pub async fn execute(&self, action: InternalAction) -> Result<ActionId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        let method = Method::Internal(action.clone());
        let required = method.required_authorization(self.authorizer.as_ref());
        self.authorizer
            .check(required.agent, &required.permissions, &required.restrictions)?;
        let service = self.ctx.registry.get(&action.service)?;
        let local_first = method.is_similar_to(&method);

        let key = action.key();
        let gate = self.suspensions.gate(&key);
        let _active = gate.read().await;

        if local_first {
            if let Err(e) = service.execute_action(&action).await {
                warn!(%key, error = %e, "local execution failed, action not queued");
                return Err(e);
            }
        }
        let pending = match self.ctx.queue.enqueue(action).await {
            Ok(pending) => pending,
            Err(e) => {
                if local_first {
                    // Applied locally but never sent.
                    warn!(%key, error = %e, "queueing failed after local execution");
                    self.ctx.events.emit(SyncEvent::ReloadRequired { key });
                }
                return Err(e);
            }
        };
        self.ctx.events.emit(SyncEvent::Queued {
            key,
            id: pending.id,
        });
        Ok(pending.id)
    }

    /// Deliver a host-to-host action directly. External actions are never
    /// queued, so a failed delivery is returned and not retried.
    pub async fn deliver_external(&self, action: ExternalAction) -> Result<Reply> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        let method = Method::External(action);
        let required = method.required_authorization(self.authorizer.as_ref());
        self.authorizer
            .check(required.agent, &required.permissions, &required.restrictions)?;

        let subject = method.subject().clone();
        debug!(%subject, content = %method.content().digest().short(), "delivering external action");
        let response = self
            .ctx
            .exchange
            .send(std::slice::from_ref(&method), subject, method.recipient(), None)
            .await?;
        match response.outcomes.into_iter().next() {
            Some(Outcome::Reply(reply)) => Ok(reply),
            Some(Outcome::Error(e)) => Err(SyncError::Host(e)),
            Some(Outcome::Empty) | None => Err(SyncError::InvalidResponse(
                "external action left unanswered".into(),
            )),
        }
    }

    /// Take exclusive hold of `(role, service)`, waiting for any other
    /// holder to resume.
    pub async fn suspend(&self, role: RoleId, service: &TypeIdentifier) -> SuspensionGuard {
        let key = ServiceKey::new(role, service.clone());
        let gate = self.suspensions.gate(&key).write_owned().await;
        self.suspensions.suspended().insert(key.clone());
        debug!(%key, "suspended");
        self.ctx.events.emit(SyncEvent::Suspended { key: key.clone() });
        SuspensionGuard {
            key,
            suspensions: Arc::clone(&self.suspensions),
            ctx: Arc::clone(&self.ctx),
            _gate: gate,
        }
    }

    pub fn is_suspended(&self, role: RoleId, service: &TypeIdentifier) -> bool {
        self.suspensions
            .suspended()
            .contains(&ServiceKey::new(role, service.clone()))
    }

    /// Replace local state of `service` with the host's snapshot, then redo
    /// the actions the snapshot does not contain yet.
    pub async fn reload(&self, role: &Role, service: &TypeIdentifier) -> Result<ReloadReport> {
        let guard = self.suspend(role.id, service).await;
        let report = self.reload_suspended(&guard, &role.subject).await;
        guard.resume();
        report
    }

    /// [`Self::reload`] for a caller that already holds the suspension.
    pub async fn reload_suspended(
        &self,
        guard: &SuspensionGuard,
        subject: &Identifier,
    ) -> Result<ReloadReport> {
        let ctx = &self.ctx;
        let key = guard.key();
        let service = ctx.registry.get(&key.service)?;
        let cursor = ctx.queue.store().load_audit_cursor(key).await?;
        info!(%key, %cursor, "reloading");

        let query = Query::new(
            subject.clone(),
            StateQuery {
                service: key.service.clone(),
            }
            .to_content(),
        )
        .expecting(StateReply::type_id());
        let response = self.query(Method::Query(query), subject, cursor).await?;
        let content = single_reply(&response)?;
        let snapshot = StateReply::from_content(&content)?;
        if snapshot.service != key.service {
            return Err(SyncError::InvalidResponse(format!(
                "asked for {}, got state of {}",
                key.service, snapshot.service
            )));
        }
        service.load_state(key.role, &snapshot.state).await?;

        let (cursor, acknowledged) = match &response.audit {
            Some(audit) => {
                let settled =
                    apply_audit(audit, key, &ctx.queue, &ctx.registry, &[], AuditMode::Snapshot)
                        .await?;
                (settled.cursor, settled.acknowledged)
            }
            None => (cursor, Vec::new()),
        };

        let pending = ctx.queue.pending(key);
        let mut redone = Vec::new();
        for p in pending.iter().filter(|p| p.action.executes_locally_first()) {
            service.execute_action(&p.action).await?;
            redone.push(p.id);
        }
        info!(%key, %cursor, acknowledged = acknowledged.len(), redone = redone.len(), "reloaded");
        ctx.events.emit(SyncEvent::AuditApplied {
            key: key.clone(),
            cursor,
            events: 0,
        });
        Ok(ReloadReport {
            cursor,
            acknowledged,
            redone,
            pending: pending.iter().map(|p| p.id).collect(),
        })
    }

    /// Fetch and apply the audit of `service` since the stored cursor.
    pub async fn refresh(&self, role: &Role, service: &TypeIdentifier) -> Result<AuditOutcome> {
        let guard = self.suspend(role.id, service).await;
        let outcome = self.refresh_suspended(&guard, &role.subject).await;
        guard.resume();
        outcome
    }

    /// [`Self::refresh`] for a caller that already holds the suspension.
    pub async fn refresh_suspended(
        &self,
        guard: &SuspensionGuard,
        subject: &Identifier,
    ) -> Result<AuditOutcome> {
        let ctx = &self.ctx;
        let key = guard.key();
        let cursor = ctx.queue.store().load_audit_cursor(key).await?;
        debug!(%key, %cursor, "refreshing");

        let query = Query::new(
            subject.clone(),
            AuditQuery {
                service: key.service.clone(),
            }
            .to_content(),
        );
        let response = self.query(Method::Query(query), subject, cursor).await?;
        if let Some(Outcome::Error(e)) = response.outcomes.first() {
            return Err(SyncError::Host(e.clone()));
        }
        let audit = response
            .audit
            .as_ref()
            .ok_or_else(|| SyncError::InvalidResponse("audit query answered without audit".into()))?;
        let outcome =
            apply_audit(audit, key, &ctx.queue, &ctx.registry, &[], AuditMode::Apply).await?;
        if !outcome.stale {
            ctx.events.emit(SyncEvent::AuditApplied {
                key: key.clone(),
                cursor: outcome.cursor,
                events: outcome.applied,
            });
        }
        Ok(outcome)
    }

    async fn query(&self, method: Method, subject: &Identifier, cursor: Time) -> Result<Response> {
        self.ctx
            .exchange
            .send(
                std::slice::from_ref(&method),
                subject.clone(),
                subject.host(),
                Some(Audit::request(cursor)),
            )
            .await
    }

    /// Stop dispatching, let in-flight and queued senders finish, then stop
    /// the workers. Undelivered actions stay in the store.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down synchronizer");
        self.shutdown.send_replace(true);
        let dispatch = self
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatch {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch loop panicked");
            }
        }
        self.pool.shutdown().await;
        self.ctx.events.emit(SyncEvent::ShutDown);
    }
}

fn single_reply(response: &Response) -> Result<rolesync_core::ContentBlock> {
    match response.outcomes.first() {
        Some(Outcome::Reply(reply)) => reply
            .content()
            .cloned()
            .ok_or_else(|| SyncError::InvalidResponse("empty state reply".into())),
        Some(Outcome::Error(e)) => Err(SyncError::Host(e.clone())),
        Some(Outcome::Empty) | None => Err(SyncError::InvalidResponse("no state reply".into())),
    }
}

/// The single task that hands ready batches to the worker pool.
struct Dispatcher {
    ctx: Arc<SyncContext>,
    pool: Arc<WorkerPool>,
    suspensions: Arc<Suspensions>,
    shutdown: watch::Receiver<bool>,
}

enum Round {
    /// At least one sender was submitted.
    Submitted,
    /// Nothing was ready.
    Idle,
    /// The pool was full.
    Rejected,
    /// The pool is closed.
    Closed,
}

impl Dispatcher {
    async fn run(mut self) {
        let config = &self.ctx.config;
        let mut backoff = Backoff::new(config.backoff_floor(), config.backoff_ceiling());
        info!(workers = config.workers, "dispatch loop started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let ctx = Arc::clone(&self.ctx);
            let notified = ctx.queue.notified();
            let wait = match self.round().await {
                Round::Closed => break,
                Round::Rejected => {
                    let delay = backoff.next();
                    debug!(?delay, "worker pool full, backing off");
                    self.ctx.events.emit(SyncEvent::CapacityBackoff { delay });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = self.shutdown.changed() => if changed.is_err() { break },
                    }
                    continue;
                }
                Round::Submitted => {
                    backoff.reset();
                    config.backoff_ceiling()
                }
                Round::Idle => backoff.next(),
            };
            let wait = match ctx.queue.next_deferral() {
                Some(at) => wait.min(at.saturating_duration_since(Instant::now())),
                None => wait,
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
                changed = self.shutdown.changed() => if changed.is_err() { break },
            }
        }
        info!("dispatch loop stopped");
    }

    async fn round(&self) -> Round {
        let ctx = &self.ctx;
        let mut submitted = false;
        for key in ctx.queue.ready_keys(Instant::now()) {
            let Ok(active) = self.suspensions.gate(&key).try_read_owned() else {
                debug!(%key, "suspended, not dispatching");
                continue;
            };
            let batch = match ctx.queue.dequeue_ready_batch(&key, ctx.config.max_batch).await {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => batch,
                Err(e) => {
                    warn!(%key, error = %e, "failed to take batch");
                    continue;
                }
            };
            let sender = Sender::new(Arc::clone(ctx), key.clone(), batch);
            let ids = sender.ids();
            let task_key = key.clone();
            let task = Box::pin(async move {
                let _active = active;
                if let Err(e) = sender.run().await {
                    debug!(key = %task_key, error = %e, "sender returned a local error");
                }
            });
            match self.pool.try_submit(task) {
                Ok(()) => {
                    debug!(%key, actions = ids.len(), "sender submitted");
                    submitted = true;
                }
                Err(rejected) => {
                    if let Err(e) = ctx.queue.release(&key, &ids).await {
                        warn!(%key, error = %e, "failed to release rejected batch");
                    }
                    return match rejected {
                        Rejected::Full => Round::Rejected,
                        Rejected::Closed => Round::Closed,
                    };
                }
            }
        }
        if submitted {
            Round::Submitted
        } else {
            Round::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;
    use rolesync_core::{AgentId, AuditEvent, ContentBlock, Effect, HostIdentifier, Keypair};
    use rolesync_envelope::{
        DecryptionKey, Draft, EncryptionContext, Envelope, KeyTableVerifier, KeypairSigner, Signer,
        Slot,
    };
    use rolesync_store::{MemoryStore, Store};

    use crate::collaborators::{GrantAuthorizer, KeyTable, LocalResolver, OpenAuthorizer, StaticSigning};
    use crate::method::ActionReply;
    use crate::registry::Service;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::RequestHandler;

    #[derive(Default)]
    struct Counter {
        executed: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Service for Counter {
        fn identifier(&self) -> TypeIdentifier {
            TypeIdentifier::from_static("notes@test")
        }

        async fn execute_action(&self, _: &InternalAction) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SyncError::Service("local failure".into()));
            }
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute_reply(&self, _: &InternalAction, _: &ActionReply) -> Result<()> {
            Ok(())
        }

        async fn apply_event(&self, _: RoleId, _: &AuditEvent) -> Result<()> {
            Ok(())
        }

        async fn load_state(&self, _: RoleId, _: &Bytes) -> Result<()> {
            Ok(())
        }
    }

    fn service() -> TypeIdentifier {
        TypeIdentifier::from_static("notes@test")
    }

    fn action(effect: Effect) -> InternalAction {
        InternalAction::new(
            RoleId(1),
            Identifier::new("alice@host.test").unwrap(),
            service(),
            ContentBlock::new(TypeIdentifier::from_static("note@test"), &b"n"[..]),
            effect,
        )
    }

    /// Answers every slot with a host-signed "ok" note.
    struct Acknowledger {
        signer: KeypairSigner,
        requests: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for Acknowledger {
        async fn handle(&self, request: Bytes) -> Result<Bytes> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let request = Envelope::decode(&request, DecryptionKey::None, &KeyTableVerifier::new())?;
            let ok = ContentBlock::new(TypeIdentifier::from_static("note@test"), &b"ok"[..]);
            let slots = vec![Slot::Signed(Some(ok)); request.len()];
            Ok(Draft::response(request.subject.clone(), slots)
                .at(Time(1))
                .encode(Some(&self.signer as &dyn Signer), &EncryptionContext::Plain)?)
        }
    }

    fn host() -> HostIdentifier {
        HostIdentifier::new("host.test").unwrap()
    }

    fn external() -> ExternalAction {
        ExternalAction {
            subject: Identifier::new("bob@host.test").unwrap(),
            content: ContentBlock::new(TypeIdentifier::from_static("invite@test"), &b"i"[..]),
        }
    }

    async fn synchronizer(
        authorizer: Arc<dyn Authorizer>,
    ) -> (Synchronizer, Arc<Counter>) {
        synchronizer_on(authorizer, MemoryNetwork::new(), KeyTableVerifier::new()).await
    }

    async fn synchronizer_on(
        authorizer: Arc<dyn Authorizer>,
        network: Arc<MemoryNetwork>,
        verifier: KeyTableVerifier,
    ) -> (Synchronizer, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let queue = ActionQueue::open(Arc::new(MemoryStore::new())).await.unwrap();
        let exchange = Exchange::new(
            network,
            Arc::new(StaticSigning::new(Arc::new(KeypairSigner::client(Keypair::generate())))),
            Arc::new(KeyTable::new()),
            Arc::new(LocalResolver::new()),
            Arc::new(verifier),
        );
        let ctx = SyncContext::new(
            queue,
            exchange,
            ServiceRegistry::new().with(counter.clone()),
            SyncConfig::default(),
        );
        (Synchronizer::new(ctx, authorizer), counter)
    }

    #[tokio::test]
    async fn test_similar_action_executes_before_return() {
        let (sync, counter) = synchronizer(Arc::new(OpenAuthorizer)).await;
        let id = sync.execute(action(Effect::Deterministic)).await.unwrap();
        assert_eq!(counter.executed.load(Ordering::SeqCst), 1);
        assert_eq!(sync.context().queue.head(&action(Effect::Deterministic).key()).unwrap().id, id);
    }

    #[tokio::test]
    async fn test_dissimilar_action_waits_for_reply() {
        let (sync, counter) = synchronizer(Arc::new(OpenAuthorizer)).await;
        sync.execute(action(Effect::HostAssigned)).await.unwrap();
        assert_eq!(counter.executed.load(Ordering::SeqCst), 0);
        assert_eq!(sync.context().queue.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_local_execution_not_queued() {
        let (sync, counter) = synchronizer(Arc::new(OpenAuthorizer)).await;
        let mut events = sync.subscribe();
        counter.failing.store(true, Ordering::SeqCst);

        let err = sync.execute(action(Effect::Deterministic)).await.unwrap_err();
        assert!(matches!(err, SyncError::Service(_)));
        assert!(sync.context().queue.is_empty());
        assert!(sync
            .context()
            .queue
            .store()
            .load_all_pending()
            .await
            .unwrap()
            .is_empty());
        assert!(events.try_recv().is_err());

        counter.failing.store(false, Ordering::SeqCst);
        sync.execute(action(Effect::Deterministic)).await.unwrap();
        assert_eq!(sync.context().queue.len(), 1);
        assert_eq!(counter.executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_external_action_delivered_without_queueing() {
        let kp = Keypair::generate();
        let verifier = KeyTableVerifier::new();
        verifier.insert_host(&host(), kp.public_key());
        let network = MemoryNetwork::new();
        let acknowledger = Arc::new(Acknowledger {
            signer: KeypairSigner::host(&host(), kp),
            requests: AtomicUsize::new(0),
        });
        network.register(host(), acknowledger.clone()).await;
        let (sync, counter) = synchronizer_on(Arc::new(OpenAuthorizer), network, verifier).await;
        let mut events = sync.subscribe();

        let reply = sync.deliver_external(external()).await.unwrap();
        assert_eq!(reply.content().map(|c| c.payload.as_ref()), Some(&b"ok"[..]));
        assert_eq!(acknowledger.requests.load(Ordering::SeqCst), 1);
        assert_eq!(counter.executed.load(Ordering::SeqCst), 0);
        assert!(sync.context().queue.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_undeliverable_external_action_not_retried() {
        let (sync, _) = synchronizer(Arc::new(OpenAuthorizer)).await;
        let err = sync.deliver_external(external()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(sync.context().queue.is_empty());
        assert!(sync.context().queue.next_deferral().is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_action_not_queued() {
        let (sync, _) = synchronizer(Arc::new(GrantAuthorizer::new())).await;
        let err = sync
            .execute(action(Effect::Deterministic).with_agent(AgentId(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
        assert!(sync.context().queue.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_service_rejected() {
        let (sync, _) = synchronizer(Arc::new(OpenAuthorizer)).await;
        let mut unknown = action(Effect::Deterministic);
        unknown.service = TypeIdentifier::from_static("unknown@test");
        assert!(matches!(
            sync.execute(unknown).await,
            Err(SyncError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_suspension_is_exclusive() {
        let (sync, _) = synchronizer(Arc::new(OpenAuthorizer)).await;
        let sync = Arc::new(sync);
        let first = sync.suspend(RoleId(1), &service()).await;
        assert!(sync.is_suspended(RoleId(1), &service()));

        let second = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                let guard = sync.suspend(RoleId(1), &service()).await;
                guard.resume();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        // Other keys are independent.
        let other = sync.suspend(RoleId(2), &service()).await;
        other.resume();

        first.resume();
        second.await.unwrap();
        assert!(!sync.is_suspended(RoleId(1), &service()));
    }

    #[tokio::test]
    async fn test_execute_waits_for_resume() {
        let (sync, counter) = synchronizer(Arc::new(OpenAuthorizer)).await;
        let sync = Arc::new(sync);
        let guard = sync.suspend(RoleId(1), &service()).await;

        let pending = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move { sync.execute(action(Effect::Deterministic)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.executed.load(Ordering::SeqCst), 0);

        guard.resume();
        pending.await.unwrap().unwrap();
        assert_eq!(counter.executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_after_shutdown() {
        let (sync, _) = synchronizer(Arc::new(OpenAuthorizer)).await;
        sync.start();
        let mut events = sync.subscribe();
        sync.shutdown().await;
        assert_eq!(events.recv().await.unwrap(), SyncEvent::ShutDown);
        assert!(matches!(
            sync.execute(action(Effect::Deterministic)).await,
            Err(SyncError::ShutDown)
        ));
    }
}
