//! Error types for the sync module.

use rolesync_core::{CoreError, Identifier, TypeIdentifier};
use rolesync_envelope::EnvelopeError;
use rolesync_store::StoreError;
use thiserror::Error;

use crate::protocol::HostError;

/// How an error should be treated by the layers above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed envelope or response. Never retried by the exchange.
    Structural,
    /// Connection failure or timeout. Retried with backoff.
    Transport,
    /// Key rotation or relocation that outlived its retry budget.
    ProtocolRecoverable,
    /// The host rejected the action. Failed and reported.
    Application,
    /// Local storage or execution failure. Propagated to the caller.
    Local,
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("malformed content: {0}")]
    Content(#[from] CoreError),

    /// The response broke one of the exchange invariants.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// The host kept asking for a resend.
    #[error("gave up after {iterations} iterations: {reason}")]
    RetriesExhausted { iterations: u32, reason: String },

    #[error("host error: {0}")]
    Host(HostError),

    #[error("{from} relocated to {to}, which is a different identity")]
    IdentityMismatch { from: Identifier, to: Identifier },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("service error: {0}")]
    Service(String),

    #[error("no service registered for {0}")]
    UnknownService(TypeIdentifier),

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("synchronizer is shut down")]
    ShutDown,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Envelope(EnvelopeError::UnwrapFailed) => ErrorKind::ProtocolRecoverable,
            Self::Envelope(_) | Self::Content(_) | Self::InvalidResponse(_) => {
                ErrorKind::Structural
            }
            Self::Transport(_) | Self::Timeout(_) => ErrorKind::Transport,
            Self::RetriesExhausted { .. } => ErrorKind::ProtocolRecoverable,
            Self::Host(e) if e.code.is_recoverable() => ErrorKind::ProtocolRecoverable,
            Self::Host(_) | Self::IdentityMismatch { .. } | Self::Unauthorized(_) => {
                ErrorKind::Application
            }
            Self::Store(_)
            | Self::Service(_)
            | Self::UnknownService(_)
            | Self::Collaborator(_)
            | Self::ShutDown => ErrorKind::Local,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
