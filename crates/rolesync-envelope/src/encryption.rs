//! The encryption frame.
//!
//! `[u8 recipient?][recipient][u8 mode]` followed by one of:
//! - mode 0, plaintext: `[u32 len][element list]`
//! - mode 1, request-wrapped: `[32 ephemeral key][12 nonce][u32 len wrapped key][12 nonce][u32 len ciphertext]`
//! - mode 2, symmetric: `[12 nonce][u32 len ciphertext]`
//!
//! A request to a host with a known key carries a fresh symmetric key
//! wrapped for that host; the host answers under the same symmetric key.

use bytes::Bytes;
use rolesync_core::{CoreError, HostIdentifier, WireReader, WireWriter};

use crate::crypto::{
    EncryptionKey, EncryptionNonce, EphemeralKeyPair, X25519PublicKey, X25519StaticSecret,
};
use crate::error::{EnvelopeError, Result};

const MODE_PLAIN: u8 = 0;
const MODE_WRAPPED: u8 = 1;
const MODE_SYMMETRIC: u8 = 2;

/// How to protect an outgoing element list.
#[derive(Debug, Clone, Default)]
pub enum EncryptionContext {
    #[default]
    Plain,
    /// Encrypt under `key`, wrapped for the host owning `host_key`.
    Request {
        host_key: X25519PublicKey,
        key: EncryptionKey,
    },
    /// Encrypt under the key the request arrived with.
    Response { key: EncryptionKey },
}

impl EncryptionContext {
    /// A request context with a fresh symmetric key.
    pub fn for_host(host_key: X25519PublicKey) -> Self {
        Self::Request {
            host_key,
            key: EncryptionKey::generate(),
        }
    }

    /// The symmetric key the answer will be encrypted under, if any.
    pub fn symmetric_key(&self) -> Option<&EncryptionKey> {
        match self {
            Self::Plain => None,
            Self::Request { key, .. } | Self::Response { key } => Some(key),
        }
    }
}

/// What the receiver decrypts with.
#[derive(Debug, Clone, Copy, Default)]
pub enum DecryptionKey<'a> {
    #[default]
    None,
    /// A host unwrapping request keys with its static secret.
    Host(&'a X25519StaticSecret),
    /// A client expecting an answer under its request key.
    Symmetric(&'a EncryptionKey),
}

/// A decoded encryption frame.
#[derive(Debug)]
pub struct OpenedFrame {
    pub recipient: Option<HostIdentifier>,
    pub list: Bytes,
    /// The symmetric key the frame was encrypted under, if it was.
    pub key: Option<EncryptionKey>,
}

/// Seal an element list.
pub fn seal(
    recipient: Option<&HostIdentifier>,
    list: &[u8],
    context: &EncryptionContext,
) -> Result<Bytes> {
    let mut w = WireWriter::new();
    match recipient {
        Some(host) => {
            w.put_bool(true);
            w.put_host(host);
        }
        None => w.put_bool(false),
    }
    match context {
        EncryptionContext::Plain => {
            w.put_u8(MODE_PLAIN);
            w.put_bytes(list);
        }
        EncryptionContext::Request { host_key, key } => {
            let ephemeral = EphemeralKeyPair::generate();
            let ephemeral_public = ephemeral.public_key();
            let wrap_key = ephemeral
                .diffie_hellman(host_key)
                .derive_wrap_key(&ephemeral_public);
            let wrap_nonce = EncryptionNonce::generate();
            let wrapped = wrap_key.encrypt(key.as_bytes(), &wrap_nonce)?;
            let nonce = EncryptionNonce::generate();
            let ciphertext = key.encrypt(list, &nonce)?;

            w.put_u8(MODE_WRAPPED);
            w.put_raw(ephemeral_public.as_bytes());
            w.put_raw(wrap_nonce.as_bytes());
            w.put_bytes(&wrapped);
            w.put_raw(nonce.as_bytes());
            w.put_bytes(&ciphertext);
        }
        EncryptionContext::Response { key } => {
            let nonce = EncryptionNonce::generate();
            let ciphertext = key.encrypt(list, &nonce)?;
            w.put_u8(MODE_SYMMETRIC);
            w.put_raw(nonce.as_bytes());
            w.put_bytes(&ciphertext);
        }
    }
    Ok(w.finish())
}

/// Open an encryption frame.
///
/// A plaintext frame is accepted whatever key the caller holds: a host that
/// could not unwrap a request key answers in the clear.
pub fn open(bytes: &[u8], key: DecryptionKey<'_>) -> Result<OpenedFrame> {
    let mut r = WireReader::new(bytes);
    let recipient = if r.get_bool("recipient present")? {
        Some(r.get_host()?)
    } else {
        None
    };
    let opened = match r.get_u8()? {
        MODE_PLAIN => OpenedFrame {
            recipient,
            list: Bytes::copy_from_slice(r.get_bytes()?),
            key: None,
        },
        MODE_WRAPPED => {
            let ephemeral = X25519PublicKey::from_bytes(r.get_array()?);
            let wrap_nonce = EncryptionNonce::from_bytes(r.get_array()?);
            let wrapped = r.get_bytes()?;
            let nonce = EncryptionNonce::from_bytes(r.get_array()?);
            let ciphertext = r.get_bytes()?;

            let DecryptionKey::Host(secret) = key else {
                return Err(EnvelopeError::MissingKey);
            };
            let wrap_key = secret.diffie_hellman(&ephemeral).derive_wrap_key(&ephemeral);
            let raw = wrap_key
                .decrypt(wrapped, &wrap_nonce)
                .map_err(|_| EnvelopeError::UnwrapFailed)?;
            let raw: [u8; 32] = raw.try_into().map_err(|_| EnvelopeError::UnwrapFailed)?;
            let symmetric = EncryptionKey::from_bytes(raw);
            let list = symmetric.decrypt(ciphertext, &nonce)?;
            OpenedFrame {
                recipient,
                list: list.into(),
                key: Some(symmetric),
            }
        }
        MODE_SYMMETRIC => {
            let nonce = EncryptionNonce::from_bytes(r.get_array()?);
            let ciphertext = r.get_bytes()?;
            let DecryptionKey::Symmetric(symmetric) = key else {
                return Err(EnvelopeError::MissingKey);
            };
            let list = symmetric.decrypt(ciphertext, &nonce)?;
            OpenedFrame {
                recipient,
                list: list.into(),
                key: Some(symmetric.clone()),
            }
        }
        tag => {
            return Err(CoreError::InvalidTag {
                field: "encryption mode",
                tag,
            }
            .into())
        }
    };
    r.finish()?;
    Ok(opened)
}
