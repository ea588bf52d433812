//! Interfaces the synchronizer consumes from the rest of the client.
//!
//! Each trait has a small in-process implementation used by the facade and
//! by tests.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use rolesync_core::{AgentId, HostIdentifier, Identifier};
use rolesync_envelope::{Signer, X25519PublicKey};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::method::{Method, Permissions, Restrictions};

/// A resolved identity. Two identifiers denote the same identity when their
/// numbers are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub number: u64,
    pub identifier: Identifier,
}

/// Identity resolution.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, identifier: &Identifier) -> Result<Identity>;

    /// The identifier `identifier` moved to, if known.
    async fn resolve_successor(&self, identifier: &Identifier) -> Result<Option<Identifier>>;

    /// Record that all `identifiers` now denote `into`.
    async fn merge_identities(&self, identifiers: &[Identifier], into: &Identifier) -> Result<()>;
}

/// The active signing context of the client.
#[async_trait]
pub trait SigningContext: Send + Sync {
    fn signer(&self) -> Arc<dyn Signer>;

    /// Re-commit to the rotated key of `host`.
    async fn recommit(&self, host: &HostIdentifier) -> Result<()>;
}

/// Known x25519 keys of hosts.
#[async_trait]
pub trait HostKeys: Send + Sync {
    /// `None` sends requests to `host` in plaintext.
    async fn encryption_key(&self, host: &HostIdentifier) -> Result<Option<X25519PublicKey>>;

    /// Drop or re-fetch a key the host no longer accepts.
    async fn refresh(&self, host: &HostIdentifier) -> Result<()>;
}

/// Authorization of methods before they are queued.
pub trait Authorizer: Send + Sync {
    fn required_permissions(&self, method: &Method) -> Permissions;

    fn required_restrictions(&self, method: &Method) -> Restrictions;

    fn check(
        &self,
        agent: Option<AgentId>,
        permissions: &Permissions,
        restrictions: &Restrictions,
    ) -> Result<()>;
}

/// Permits every method.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAuthorizer;

impl Authorizer for OpenAuthorizer {
    fn required_permissions(&self, _method: &Method) -> Permissions {
        Permissions::none()
    }

    fn required_restrictions(&self, _method: &Method) -> Restrictions {
        Restrictions::default()
    }

    fn check(&self, _: Option<AgentId>, _: &Permissions, _: &Restrictions) -> Result<()> {
        Ok(())
    }
}

/// Grants each agent a fixed set of service permissions. The client itself
/// (no agent) may do anything.
#[derive(Debug, Default)]
pub struct GrantAuthorizer {
    grants: RwLock<HashMap<AgentId, Permissions>>,
}

impl GrantAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, agent: AgentId, permissions: Permissions) {
        self.grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent, permissions);
    }
}

impl Authorizer for GrantAuthorizer {
    fn required_permissions(&self, method: &Method) -> Permissions {
        match method {
            Method::Internal(a) => Permissions::of(a.service.clone()),
            Method::Query(_) | Method::External(_) => Permissions::none(),
        }
    }

    fn required_restrictions(&self, method: &Method) -> Restrictions {
        Restrictions {
            client_only: matches!(method, Method::External(_)),
            role: method.role(),
            writing: method.is_action(),
        }
    }

    fn check(
        &self,
        agent: Option<AgentId>,
        permissions: &Permissions,
        restrictions: &Restrictions,
    ) -> Result<()> {
        let Some(agent) = agent else { return Ok(()) };
        if restrictions.client_only {
            return Err(SyncError::Unauthorized(format!(
                "agent {} cannot send client-only methods",
                agent.0
            )));
        }
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        let granted = grants.get(&agent).cloned().unwrap_or_default();
        if !permissions.is_subset(&granted) {
            return Err(SyncError::Unauthorized(format!(
                "agent {} lacks {:?}",
                agent.0, permissions.0
            )));
        }
        Ok(())
    }
}

/// A signer that never rotates.
pub struct StaticSigning {
    signer: Arc<dyn Signer>,
}

impl StaticSigning {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl SigningContext for StaticSigning {
    fn signer(&self) -> Arc<dyn Signer> {
        Arc::clone(&self.signer)
    }

    async fn recommit(&self, host: &HostIdentifier) -> Result<()> {
        debug!(%host, "recommit requested, signer is static");
        Ok(())
    }
}

/// Host encryption keys held in memory. Refreshing forgets the key, so the
/// next request goes out in plaintext until a key is inserted again.
#[derive(Debug, Default)]
pub struct KeyTable {
    keys: RwLock<HashMap<HostIdentifier, X25519PublicKey>>,
}

impl KeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: HostIdentifier, key: X25519PublicKey) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host, key);
    }
}

#[async_trait]
impl HostKeys for KeyTable {
    async fn encryption_key(&self, host: &HostIdentifier) -> Result<Option<X25519PublicKey>> {
        Ok(self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .copied())
    }

    async fn refresh(&self, host: &HostIdentifier) -> Result<()> {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Directory {
    numbers: HashMap<Identifier, u64>,
    successors: HashMap<Identifier, Identifier>,
    next: u64,
}

impl Directory {
    fn number(&mut self, identifier: &Identifier) -> u64 {
        if let Some(n) = self.numbers.get(identifier) {
            return *n;
        }
        self.next += 1;
        self.numbers.insert(identifier.clone(), self.next);
        self.next
    }
}

/// Resolves identities from an in-memory directory. Unknown identifiers
/// get a fresh number on first sight.
#[derive(Debug, Default)]
pub struct LocalResolver {
    directory: RwLock<Directory>,
}

impl LocalResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `successor` denotes the same identity as `identifier`
    /// and that `identifier` moved there.
    pub fn relocate(&self, identifier: &Identifier, successor: &Identifier) {
        let mut dir = self.directory.write().unwrap_or_else(PoisonError::into_inner);
        let number = dir.number(identifier);
        dir.numbers.insert(successor.clone(), number);
        dir.successors.insert(identifier.clone(), successor.clone());
    }
}

#[async_trait]
impl IdentityResolver for LocalResolver {
    async fn resolve(&self, identifier: &Identifier) -> Result<Identity> {
        let mut dir = self.directory.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Identity {
            number: dir.number(identifier),
            identifier: identifier.clone(),
        })
    }

    async fn resolve_successor(&self, identifier: &Identifier) -> Result<Option<Identifier>> {
        let dir = self.directory.read().unwrap_or_else(PoisonError::into_inner);
        Ok(dir.successors.get(identifier).cloned())
    }

    async fn merge_identities(&self, identifiers: &[Identifier], into: &Identifier) -> Result<()> {
        let mut dir = self.directory.write().unwrap_or_else(PoisonError::into_inner);
        let number = dir.number(into);
        for id in identifiers.iter().filter(|id| *id != into) {
            dir.numbers.insert(id.clone(), number);
            dir.successors.insert(id.clone(), into.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_core::{ContentBlock, Effect, InternalAction, RoleId, TypeIdentifier};

    fn id(s: &str) -> Identifier {
        Identifier::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_resolver_relocation() {
        let resolver = LocalResolver::new();
        let old = id("alice@old.test");
        let new = id("alice@new.test");
        let other = id("bob@new.test");

        assert_ne!(
            resolver.resolve(&old).await.unwrap().number,
            resolver.resolve(&other).await.unwrap().number
        );
        resolver.relocate(&old, &new);
        assert_eq!(resolver.resolve_successor(&old).await.unwrap(), Some(new.clone()));
        assert_eq!(
            resolver.resolve(&old).await.unwrap().number,
            resolver.resolve(&new).await.unwrap().number
        );
    }

    #[tokio::test]
    async fn test_merge_identities() {
        let resolver = LocalResolver::new();
        let a = id("a@one.test");
        let b = id("b@two.test");
        resolver.merge_identities(&[a.clone()], &b).await.unwrap();
        assert_eq!(resolver.resolve_successor(&a).await.unwrap(), Some(b.clone()));
        assert_eq!(
            resolver.resolve(&a).await.unwrap().number,
            resolver.resolve(&b).await.unwrap().number
        );
    }

    #[tokio::test]
    async fn test_key_table_refresh_forgets() {
        let table = KeyTable::new();
        let host = HostIdentifier::new("host.test").unwrap();
        table.insert(host.clone(), X25519PublicKey::from_bytes([7; 32]));
        assert!(table.encryption_key(&host).await.unwrap().is_some());
        table.refresh(&host).await.unwrap();
        assert!(table.encryption_key(&host).await.unwrap().is_none());
    }

    #[test]
    fn test_grant_authorizer() {
        let auth = GrantAuthorizer::new();
        let service = TypeIdentifier::from_static("notes@test");
        let method = Method::Internal(
            InternalAction::new(
                RoleId(1),
                id("alice@host.test"),
                service.clone(),
                ContentBlock::empty(TypeIdentifier::from_static("note@test")),
                Effect::Deterministic,
            )
            .with_agent(AgentId(9)),
        );
        let required = method.required_authorization(&auth);
        assert!(matches!(
            auth.check(required.agent, &required.permissions, &required.restrictions),
            Err(SyncError::Unauthorized(_))
        ));

        auth.grant(AgentId(9), Permissions::of(service));
        auth.check(required.agent, &required.permissions, &required.restrictions)
            .unwrap();
        auth.check(None, &required.permissions, &required.restrictions)
            .unwrap();
    }
}
