//! # rolesync envelope
//!
//! The layered wire format every request and response travels in.
//!
//! ## Layers
//!
//! 1. **Content**: a typed payload ([`rolesync_core::ContentBlock`])
//! 2. **Compression**: zlib unless the payload is empty
//! 3. **Signature**: host, client or credential proof over the block ([`SignedBlock`])
//! 4. **Encryption**: optional ChaCha20-Poly1305 under a per-request key
//!    wrapped for the recipient host with X25519
//! 5. **Outer frame**: packet type, length and explicit element count
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rolesync_envelope::{Draft, Slot, EncryptionContext, Envelope, DecryptionKey};
//!
//! // let bytes = Draft::request(subject, host, vec![Slot::Signed(Some(content))])
//! //     .encode(Some(&signer), &EncryptionContext::Plain)?;
//! // let envelope = Envelope::decode(&bytes, DecryptionKey::None, &verifier)?;
//! ```

pub mod crypto;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod signature;

pub use crypto::{EncryptionKey, EncryptionNonce, X25519PublicKey, X25519StaticSecret};
pub use encryption::{DecryptionKey, EncryptionContext};
pub use envelope::{
    Draft, Element, Envelope, PacketType, Slot, MAX_FRAME_LEN, REQUEST_PACKET, RESPONSE_PACKET,
};
pub use error::{EnvelopeError, Result};
pub use signature::{
    KeyTableVerifier, KeypairSigner, Seal, SignatureVariant, SignedBlock, Signer, Verifier,
};
