//! Error types for the rolesync core.

use thiserror::Error;

/// Errors raised while building, encoding or decoding core blocks.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid {field} tag: {tag}")]
    InvalidTag { field: &'static str, tag: u8 },

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("{0} trailing bytes after block")]
    TrailingBytes(usize),

    #[error("length {len} exceeds limit {limit}")]
    LengthExceeded { len: usize, limit: usize },

    #[error("compression error: {0}")]
    Compression(String),

    #[error("invalid audit: {0}")]
    InvalidAudit(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
