//! Error types for envelope encoding and decoding.

use thiserror::Error;

/// Errors raised by the envelope codec.
///
/// Everything except [`EnvelopeError::UnwrapFailed`] describes a malformed
/// or untrustworthy envelope and is never worth retrying.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed block: {0}")]
    Core(#[from] rolesync_core::CoreError),

    #[error("envelope has no elements")]
    Empty,

    #[error("element count mismatch: frame declares {declared}, list has {actual}")]
    CountMismatch { declared: usize, actual: usize },

    #[error("unexpected packet type {0}")]
    UnexpectedPacket(String),

    #[error("frame of {len} bytes exceeds limit {limit}")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("request has no recipient")]
    MissingRecipient,

    #[error("request slot {0} is null")]
    NullRequestSlot(usize),

    #[error("envelope has no subject: every slot is null")]
    MissingSubject,

    #[error("element {0} is not signed alike with the first signed element")]
    NotSignedAlike(usize),

    #[error("element {0} is about a different subject")]
    SubjectMismatch(usize),

    #[error("audit attached more than once")]
    DuplicateAudit,

    #[error("signature verification failed: {0}")]
    BadSignature(String),

    #[error("no signer for a signed element")]
    MissingSigner,

    #[error("encrypted frame but no decryption key")]
    MissingKey,

    /// The recipient could not unwrap the request key; its key has rotated.
    #[error("could not unwrap request key")]
    UnwrapFailed,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),
}

/// Result type for envelope operations.
pub type Result<T> = std::result::Result<T, EnvelopeError>;
