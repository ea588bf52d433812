//! Test fixtures: an in-memory host, recording collaborators and a harness
//! wiring them to a synchronizer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rolesync::{Client, ClientConfig, Collaborators};
use rolesync_core::{
    Audit, AuditEvent, ContentBlock, Effect, HostIdentifier, Identifier, InternalAction, Keypair,
    ResponseAudit, RoleId, Time, TypeIdentifier, WireReader,
};
use rolesync_envelope::{
    DecryptionKey, Draft, EncryptionContext, Envelope, EnvelopeError, KeyTableVerifier,
    KeypairSigner, Signer, Slot, X25519PublicKey, X25519StaticSecret,
};
use rolesync_store::MemoryStore;
use rolesync_sync::{
    ActionQueue, ActionReply, AuditQuery, ErrorCode, Exchange, HostError, KeyTable, LocalResolver,
    MemoryNetwork, OpenAuthorizer, Relocation, RequestHandler, Result, Service, ServiceRegistry,
    SigningContext, StateQuery, StateReply, SyncConfig, SyncContext, Synchronizer,
};
use tracing::debug;

/// The service every fixture registers.
pub const NOTES: &str = "notes@test.rolesync.net";

/// Content type of the actions fixtures build.
pub const NOTE: &str = "note@test.rolesync.net";

pub fn notes() -> TypeIdentifier {
    TypeIdentifier::from_static(NOTES)
}

/// Parse a user identifier, panicking on malformed test input.
pub fn identifier(s: &str) -> Identifier {
    Identifier::new(s).expect("valid test identifier")
}

pub fn note(payload: &[u8]) -> ContentBlock {
    ContentBlock::new(TypeIdentifier::from_static(NOTE), Bytes::copy_from_slice(payload))
}

/// A notes action for role 1.
pub fn action(subject: &Identifier, payload: &[u8], effect: Effect) -> InternalAction {
    InternalAction::new(RoleId(1), subject.clone(), notes(), note(payload), effect)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Test host
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct HostState {
    clock: i64,
    log: Vec<AuditEvent>,
    requests: u32,
    rotations: u32,
    relocated_to: Option<Identifier>,
    rejected: HashSet<Bytes>,
}

impl HostState {
    fn answer(&mut self, content: &ContentBlock) -> Result<Slot> {
        if let Some(query) = StateQuery::from_content(content)? {
            let reply = StateReply {
                service: query.service,
                state: self.snapshot(),
            };
            return Ok(Slot::Signed(Some(reply.to_content())));
        }
        if AuditQuery::from_content(content)?.is_some() {
            return Ok(Slot::Signed(None));
        }
        if self.rejected.contains(&content.payload) {
            let error = HostError::new(ErrorCode::Conflict, "rejected by test host");
            return Ok(Slot::Signed(Some(error.to_content())));
        }
        self.record(content.clone());
        Ok(Slot::Signed(None))
    }

    fn record(&mut self, content: ContentBlock) {
        self.clock += 1;
        self.log.push(AuditEvent {
            time: Time(self.clock),
            content,
        });
    }

    /// Payloads of every applied action, newline separated.
    fn snapshot(&self) -> Bytes {
        let parts: Vec<&[u8]> = self.log.iter().map(|e| e.content.payload.as_ref()).collect();
        Bytes::from(parts.join(&b'\n'))
    }

    fn audit_since(&self, last: Time) -> Result<ResponseAudit> {
        let events = self.log.iter().filter(|e| e.time > last).cloned().collect();
        Ok(ResponseAudit::new(last, Time(self.clock.max(last.0)), events)?)
    }
}

/// An in-memory host serving one subject.
///
/// Every action it receives is applied and appended to its audit log; the
/// log's payloads form the state snapshot handed out on reload.
pub struct TestHost {
    subject: Identifier,
    host: HostIdentifier,
    signer: KeypairSigner,
    encryption: Mutex<X25519StaticSecret>,
    state: Mutex<HostState>,
}

impl TestHost {
    pub fn new(subject: Identifier) -> Arc<Self> {
        Self::with_keypair(subject, Keypair::generate())
    }

    pub fn with_keypair(subject: Identifier, keypair: Keypair) -> Arc<Self> {
        let host = subject.host();
        Arc::new(Self {
            signer: KeypairSigner::host(&host, keypair),
            host,
            subject,
            encryption: Mutex::new(X25519StaticSecret::generate()),
            state: Mutex::new(HostState::default()),
        })
    }

    pub fn subject(&self) -> &Identifier {
        &self.subject
    }

    pub fn host(&self) -> &HostIdentifier {
        &self.host
    }

    /// Register this host's signing key with `verifier`.
    pub fn trust(&self, verifier: &KeyTableVerifier) {
        verifier.insert_host(&self.host, self.signer.public_key());
    }

    pub fn encryption_key(&self) -> X25519PublicKey {
        lock(&self.encryption).public_key()
    }

    /// Answer the next `times` requests with `KeyRotated`.
    pub fn announce_key_rotation(&self, times: u32) {
        lock(&self.state).rotations = times;
    }

    /// Replace the encryption secret; requests wrapped for the old key
    /// are answered with `StaleEncryptionKey`.
    pub fn rotate_encryption_key(&self) {
        *lock(&self.encryption) = X25519StaticSecret::generate();
    }

    /// Answer every request with a relocation to `successor`.
    pub fn relocate_to(&self, successor: Identifier) {
        lock(&self.state).relocated_to = Some(successor);
    }

    /// Answer actions with this payload with a `Conflict` error.
    pub fn reject(&self, payload: &[u8]) {
        lock(&self.state)
            .rejected
            .insert(Bytes::copy_from_slice(payload));
    }

    /// Apply an action made by another client.
    pub fn record_foreign(&self, content: ContentBlock) -> Time {
        let mut state = lock(&self.state);
        state.record(content);
        Time(state.clock)
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.state).log.clone()
    }

    /// Payloads applied, in host order.
    pub fn applied(&self) -> Vec<Bytes> {
        lock(&self.state)
            .log
            .iter()
            .map(|e| e.content.payload.clone())
            .collect()
    }

    /// Requests received, including ones answered with a retry signal.
    pub fn requests(&self) -> u32 {
        lock(&self.state).requests
    }

    fn answer_all(
        &self,
        subject: Identifier,
        count: usize,
        content: ContentBlock,
        context: &EncryptionContext,
    ) -> Result<Bytes> {
        let slots = vec![Slot::Signed(Some(content)); count];
        Ok(Draft::response(subject, slots).encode(Some(&self.signer as &dyn Signer), context)?)
    }
}

/// The element count from the outer frame, readable without decrypting.
fn declared_count(request: &[u8]) -> Result<usize> {
    let mut r = WireReader::new(request);
    r.get_type()?;
    r.get_u32()?;
    Ok(r.get_u32()? as usize)
}

#[async_trait]
impl RequestHandler for TestHost {
    async fn handle(&self, request: Bytes) -> Result<Bytes> {
        let decoded = {
            let secret = lock(&self.encryption);
            Envelope::decode(&request, DecryptionKey::Host(&*secret), &KeyTableVerifier::new())
        };
        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(EnvelopeError::UnwrapFailed) => {
                lock(&self.state).requests += 1;
                debug!(host = %self.host, "cannot unwrap request key");
                let stale = HostError::new(ErrorCode::StaleEncryptionKey, "unknown key");
                return self.answer_all(
                    self.subject.clone(),
                    declared_count(&request)?,
                    stale.to_content(),
                    &EncryptionContext::Plain,
                );
            }
            Err(e) => return Err(e.into()),
        };
        let context = match envelope.key.clone() {
            Some(key) => EncryptionContext::Response { key },
            None => EncryptionContext::Plain,
        };

        let count = envelope.len();
        let mut state = lock(&self.state);
        state.requests += 1;
        if state.rotations > 0 {
            state.rotations -= 1;
            drop(state);
            let rotated = HostError::new(ErrorCode::KeyRotated, "signing key rotated");
            return self.answer_all(envelope.subject, count, rotated.to_content(), &context);
        }
        if let Some(successor) = state.relocated_to.clone() {
            drop(state);
            let relocation = Relocation {
                successor: Some(successor),
            };
            return self.answer_all(envelope.subject, count, relocation.to_content(), &context);
        }
        if envelope.subject != self.subject {
            drop(state);
            let missing = HostError::new(ErrorCode::NotFound, "subject not hosted here");
            return self.answer_all(envelope.subject, count, missing.to_content(), &context);
        }

        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            match envelope.content(i) {
                Some(content) => slots.push(state.answer(content)?),
                None => slots.push(Slot::Signed(None)),
            }
        }
        let audit = match &envelope.audit {
            Some(Audit::Request(cursor)) => {
                Some(Audit::Response(state.audit_since(cursor.last_time)?))
            }
            _ => None,
        };
        drop(state);

        let mut draft = Draft::response(envelope.subject, slots);
        if let Some(audit) = audit {
            draft = draft.with_audit(audit);
        }
        Ok(draft.encode(Some(&self.signer as &dyn Signer), &context)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// What a [`RecordingService`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Action(Bytes),
    Reply(Bytes),
    Event(Time, Bytes),
    Load(Bytes),
}

/// A notes service keeping its state as a list of payloads.
#[derive(Debug, Default)]
pub struct RecordingService {
    calls: Mutex<Vec<Call>>,
    state: Mutex<Vec<Bytes>>,
}

impl RecordingService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Payloads of executed actions, in call order.
    pub fn executed(&self) -> Vec<Bytes> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                Call::Action(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn state(&self) -> Vec<Bytes> {
        lock(&self.state).clone()
    }
}

#[async_trait]
impl Service for RecordingService {
    fn identifier(&self) -> TypeIdentifier {
        notes()
    }

    async fn execute_action(&self, action: &InternalAction) -> Result<()> {
        let payload = action.content.payload.clone();
        lock(&self.calls).push(Call::Action(payload.clone()));
        lock(&self.state).push(payload);
        Ok(())
    }

    async fn execute_reply(&self, action: &InternalAction, _reply: &ActionReply) -> Result<()> {
        lock(&self.calls).push(Call::Reply(action.content.payload.clone()));
        Ok(())
    }

    async fn apply_event(&self, _role: RoleId, event: &AuditEvent) -> Result<()> {
        let payload = event.content.payload.clone();
        lock(&self.calls).push(Call::Event(event.time, payload.clone()));
        lock(&self.state).push(payload);
        Ok(())
    }

    async fn load_state(&self, _role: RoleId, state: &Bytes) -> Result<()> {
        lock(&self.calls).push(Call::Load(state.clone()));
        let loaded = state
            .split(|b| *b == b'\n')
            .filter(|part| !part.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();
        *lock(&self.state) = loaded;
        Ok(())
    }
}

/// A signing context counting recommits.
pub struct RecordingSigning {
    signer: Arc<KeypairSigner>,
    recommits: AtomicU32,
}

impl RecordingSigning {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            signer: Arc::new(KeypairSigner::client(Keypair::generate())),
            recommits: AtomicU32::new(0),
        })
    }

    pub fn recommits(&self) -> u32 {
        self.recommits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SigningContext for RecordingSigning {
    fn signer(&self) -> Arc<dyn Signer> {
        self.signer.clone()
    }

    async fn recommit(&self, host: &HostIdentifier) -> Result<()> {
        debug!(%host, "recommitting");
        self.recommits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

/// A client side wired to an in-memory network of [`TestHost`]s.
pub struct Harness {
    pub network: Arc<MemoryNetwork>,
    pub verifier: Arc<KeyTableVerifier>,
    pub signing: Arc<RecordingSigning>,
    pub host_keys: Arc<KeyTable>,
    pub resolver: Arc<LocalResolver>,
    pub service: Arc<RecordingService>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            verifier: Arc::new(KeyTableVerifier::new()),
            signing: RecordingSigning::new(),
            host_keys: Arc::new(KeyTable::new()),
            resolver: Arc::new(LocalResolver::new()),
            service: RecordingService::new(),
        }
    }

    /// Make `host` reachable and trusted.
    pub async fn add_host(&self, host: &Arc<TestHost>) {
        host.trust(&self.verifier);
        self.network
            .register(host.host().clone(), host.clone() as Arc<dyn RequestHandler>)
            .await;
    }

    /// Encrypt requests to `host` from now on.
    pub fn encrypt_for(&self, host: &TestHost) {
        self.host_keys
            .insert(host.host().clone(), host.encryption_key());
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            signing: self.signing.clone(),
            host_keys: self.host_keys.clone(),
            resolver: self.resolver.clone(),
            verifier: self.verifier.clone(),
            authorizer: Arc::new(OpenAuthorizer),
        }
    }

    pub fn exchange(&self) -> Exchange {
        Exchange::new(
            self.network.clone(),
            self.signing.clone(),
            self.host_keys.clone(),
            self.resolver.clone(),
            self.verifier.clone(),
        )
    }

    pub fn registry(&self) -> ServiceRegistry {
        ServiceRegistry::new().with(self.service.clone())
    }

    /// A started synchronizer over a fresh in-memory store.
    pub async fn synchronizer(&self, config: SyncConfig) -> Result<Synchronizer> {
        let synchronizer = self.unstarted_synchronizer(config).await?;
        synchronizer.start();
        Ok(synchronizer)
    }

    /// A synchronizer whose queued actions stay queued until `start`.
    pub async fn unstarted_synchronizer(&self, config: SyncConfig) -> Result<Synchronizer> {
        let queue = ActionQueue::open(Arc::new(MemoryStore::new())).await?;
        let ctx = SyncContext::new(queue, self.exchange(), self.registry(), config);
        Ok(Synchronizer::new(ctx, Arc::new(OpenAuthorizer)))
    }

    pub async fn client(&self, config: ClientConfig) -> rolesync::Result<Client> {
        Client::with_connector(
            config,
            self.collaborators(),
            self.registry(),
            self.network.clone(),
        )
        .await
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_records_actions_and_answers_audit() {
        let alice = identifier("alice@host.test");
        let host = TestHost::new(alice.clone());
        host.record_foreign(note(b"earlier"));

        let harness = Harness::new();
        harness.add_host(&host).await;
        let method = rolesync_sync::Method::Internal(action(&alice, b"mine", Effect::HostAssigned));
        let response = harness
            .exchange()
            .send(&[method], alice.clone(), alice.host(), Some(Audit::request(Time::ZERO)))
            .await
            .unwrap();

        let audit = response.audit.unwrap();
        assert_eq!(audit.this_time, Time(2));
        assert_eq!(audit.events.len(), 2);
        assert_eq!(host.applied(), vec![Bytes::from_static(b"earlier"), Bytes::from_static(b"mine")]);
    }

    #[tokio::test]
    async fn test_snapshot_round_trips_through_service() {
        let service = RecordingService::new();
        service
            .load_state(RoleId(1), &Bytes::from_static(b"a\nb"))
            .await
            .unwrap();
        assert_eq!(service.state(), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }
}
