//! The Client: one synchronizer wired to a store, a connector and the
//! caller's collaborators.

use std::sync::Arc;

use rolesync_core::{ActionId, InternalAction, Role, TypeIdentifier};
use rolesync_envelope::Verifier;
use rolesync_store::{MemoryStore, SqliteStore, Store};
use rolesync_sync::{
    ActionQueue, AuditOutcome, Authorizer, Connector, Exchange, HostKeys, IdentityResolver,
    ReloadReport, ServiceRegistry, SigningContext, SyncContext, SyncEvent, Synchronizer,
    TcpConnector,
};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ClientConfig;
use crate::error::Result;

/// The collaborators a client delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub signing: Arc<dyn SigningContext>,
    pub host_keys: Arc<dyn HostKeys>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub verifier: Arc<dyn Verifier>,
    pub authorizer: Arc<dyn Authorizer>,
}

/// A running synchronizer.
///
/// Dispatch starts when the client is opened and stops at
/// [`shutdown`](Client::shutdown).
pub struct Client {
    synchronizer: Synchronizer,
    config: ClientConfig,
}

impl Client {
    /// Open a client that reaches hosts over TCP through `config.hosts`.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn open(
        config: ClientConfig,
        collaborators: Collaborators,
        services: ServiceRegistry,
    ) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(
            config.hosts.clone(),
            config.sync.io_timeout(),
        ));
        Self::with_connector(config, collaborators, services, connector).await
    }

    /// Open a client over any connector.
    pub async fn with_connector(
        config: ClientConfig,
        collaborators: Collaborators,
        services: ServiceRegistry,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn Store> = match &config.database {
            Some(path) => {
                info!(path = %path.display(), "opening action store");
                Arc::new(SqliteStore::open(path)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let queue = ActionQueue::open(store).await?;
        let pending = queue.len();

        let exchange = Exchange::new(
            connector,
            collaborators.signing,
            collaborators.host_keys,
            collaborators.resolver,
            collaborators.verifier,
        );
        let ctx = SyncContext::new(queue, exchange, services, config.sync.clone());
        let synchronizer = Synchronizer::new(ctx, collaborators.authorizer);
        synchronizer.start();
        info!(pending, hosts = config.hosts.len(), "client opened");

        Ok(Self {
            synchronizer,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Actions
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue an action for delivery. See [`Synchronizer::execute`].
    pub async fn execute(&self, action: InternalAction) -> Result<ActionId> {
        Ok(self.synchronizer.execute(action).await?)
    }

    /// Actions not yet acknowledged by their host.
    pub fn pending(&self) -> usize {
        self.synchronizer.context().queue.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reconciliation
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace local state of `service` with the host's snapshot.
    pub async fn reload(&self, role: &Role, service: &TypeIdentifier) -> Result<ReloadReport> {
        Ok(self.synchronizer.reload(role, service).await?)
    }

    /// Apply whatever the host recorded since the last audit.
    pub async fn refresh(&self, role: &Role, service: &TypeIdentifier) -> Result<AuditOutcome> {
        Ok(self.synchronizer.refresh(role, service).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.synchronizer.subscribe()
    }

    /// Stop dispatching and wait for in-flight deliveries.
    pub async fn shutdown(&self) {
        self.synchronizer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use rolesync_core::{
        AuditEvent, ContentBlock, Effect, HostIdentifier, Identifier, Keypair, RoleId, Time,
    };
    use rolesync_envelope::{
        DecryptionKey, Draft, EncryptionContext, Envelope, KeyTableVerifier, KeypairSigner,
        Signer, Slot,
    };
    use rolesync_sync::{
        ActionReply, KeyTable, LocalResolver, MemoryNetwork, OpenAuthorizer, RequestHandler,
        Service, StaticSigning, SyncError,
    };

    const NOTES: &str = "notes@test";

    fn host() -> HostIdentifier {
        HostIdentifier::new("host.test").unwrap()
    }

    fn subject() -> Identifier {
        Identifier::new("alice@host.test").unwrap()
    }

    /// Acknowledges every slot with an empty reply.
    struct AckHost {
        signer: KeypairSigner,
    }

    #[async_trait]
    impl RequestHandler for AckHost {
        async fn handle(&self, request: Bytes) -> rolesync_sync::Result<Bytes> {
            let request = Envelope::decode(&request, DecryptionKey::None, &KeyTableVerifier::new())?;
            let slots = (0..request.len()).map(|_| Slot::Signed(None)).collect();
            let draft = Draft::response(request.subject.clone(), slots).at(Time(1));
            Ok(draft.encode(Some(&self.signer as &dyn Signer), &EncryptionContext::Plain)?)
        }
    }

    #[derive(Default)]
    struct Notes {
        executed: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl Service for Notes {
        fn identifier(&self) -> TypeIdentifier {
            TypeIdentifier::from_static(NOTES)
        }

        async fn execute_action(&self, action: &InternalAction) -> rolesync_sync::Result<()> {
            self.executed.lock().unwrap().push(action.content.payload.clone());
            Ok(())
        }

        async fn execute_reply(&self, _: &InternalAction, _: &ActionReply) -> rolesync_sync::Result<()> {
            Ok(())
        }

        async fn apply_event(&self, _: RoleId, _: &AuditEvent) -> rolesync_sync::Result<()> {
            Ok(())
        }

        async fn load_state(&self, _: RoleId, _: &Bytes) -> rolesync_sync::Result<()> {
            Ok(())
        }
    }

    async fn client(config: ClientConfig, notes: Arc<Notes>) -> Client {
        let host_keypair = Keypair::generate();
        let network = MemoryNetwork::new();
        network
            .register(
                host(),
                Arc::new(AckHost {
                    signer: KeypairSigner::host(&host(), host_keypair.clone()),
                }),
            )
            .await;
        let verifier = KeyTableVerifier::new();
        verifier.insert_host(&host(), host_keypair.public_key());
        let collaborators = Collaborators {
            signing: Arc::new(StaticSigning::new(Arc::new(KeypairSigner::client(
                Keypair::generate(),
            )))),
            host_keys: Arc::new(KeyTable::new()),
            resolver: Arc::new(LocalResolver::new()),
            verifier: Arc::new(verifier),
            authorizer: Arc::new(OpenAuthorizer),
        };
        Client::with_connector(
            config,
            collaborators,
            ServiceRegistry::new().with(notes),
            network,
        )
        .await
        .unwrap()
    }

    fn action(payload: &'static [u8]) -> InternalAction {
        InternalAction::new(
            RoleId(1),
            subject(),
            TypeIdentifier::from_static(NOTES),
            ContentBlock::new(TypeIdentifier::from_static("note@test"), payload),
            Effect::HostAssigned,
        )
    }

    async fn delivered(events: &mut broadcast::Receiver<SyncEvent>, id: ActionId) {
        loop {
            if let SyncEvent::Delivered { id: got, .. } = events.recv().await.unwrap() {
                if got == id {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_execute_delivers_and_runs_action() {
        let notes = Arc::new(Notes::default());
        let client = client(ClientConfig::default(), notes.clone()).await;
        let mut events = client.subscribe();

        let id = client.execute(action(b"hello")).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), delivered(&mut events, id))
            .await
            .unwrap();

        assert_eq!(client.pending(), 0);
        assert_eq!(*notes.executed.lock().unwrap(), vec![Bytes::from_static(b"hello")]);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_fails() {
        let client = client(ClientConfig::default(), Arc::new(Notes::default())).await;
        client.shutdown().await;
        let err = client.execute(action(b"late")).await.unwrap_err();
        assert!(matches!(err, crate::ClientError::Sync(SyncError::ShutDown)));
    }

    #[tokio::test]
    async fn test_pending_actions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            database: Some(dir.path().join("queue.db")),
            ..ClientConfig::default()
        };

        {
            // No hosts: nothing can be delivered.
            let collaborators = Collaborators {
                signing: Arc::new(StaticSigning::new(Arc::new(KeypairSigner::client(
                    Keypair::generate(),
                )))),
                host_keys: Arc::new(KeyTable::new()),
                resolver: Arc::new(LocalResolver::new()),
                verifier: Arc::new(KeyTableVerifier::new()),
                authorizer: Arc::new(OpenAuthorizer),
            };
            let offline = Client::with_connector(
                config.clone(),
                collaborators,
                ServiceRegistry::new().with(Arc::new(Notes::default())),
                MemoryNetwork::new(),
            )
            .await
            .unwrap();
            offline.execute(action(b"kept")).await.unwrap();
            offline.shutdown().await;
        }

        let notes = Arc::new(Notes::default());
        let client = client(config, notes.clone()).await;
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while client.pending() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*notes.executed.lock().unwrap(), vec![Bytes::from_static(b"kept")]);
        client.shutdown().await;
    }
}
