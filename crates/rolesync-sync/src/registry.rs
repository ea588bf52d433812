//! Services: the local state the synchronizer keeps in step with hosts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rolesync_core::{AuditEvent, InternalAction, RoleId, TypeIdentifier};

use crate::error::{Result, SyncError};
use crate::method::ActionReply;

/// Local state of one service type, for every role.
#[async_trait]
pub trait Service: Send + Sync {
    fn identifier(&self) -> TypeIdentifier;

    /// Apply an internal action to local state.
    async fn execute_action(&self, action: &InternalAction) -> Result<()>;

    /// Apply the host's reply to a delivered action.
    async fn execute_reply(&self, action: &InternalAction, reply: &ActionReply) -> Result<()>;

    /// Apply an action some other client performed, as reported by an audit.
    async fn apply_event(&self, role: RoleId, event: &AuditEvent) -> Result<()>;

    /// Replace local state with a snapshot from the host.
    async fn load_state(&self, role: RoleId, state: &Bytes) -> Result<()>;
}

/// Lookup of services by type identifier. Built at startup.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<TypeIdentifier, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: Arc<dyn Service>) -> Self {
        self.register(service);
        self
    }

    /// Register a service, replacing any previous one of the same type.
    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.services.insert(service.identifier(), service);
    }

    pub fn get(&self, service: &TypeIdentifier) -> Result<Arc<dyn Service>> {
        self.services
            .get(service)
            .cloned()
            .ok_or_else(|| SyncError::UnknownService(service.clone()))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
