//! Error types for the client facade.

use rolesync_core::CoreError;
use rolesync_store::StoreError;
use rolesync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur while opening or driving a [`Client`](crate::Client).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Synchronization error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Invalid identifier or content.
    #[error("content error: {0}")]
    Content(#[from] CoreError),

    /// Malformed configuration document.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration that parsed but cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A tracing subscriber is already installed.
    #[error("tracing already initialized: {0}")]
    Tracing(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
