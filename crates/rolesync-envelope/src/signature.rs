//! The signature layer: signed blocks, signers and verifiers.
//!
//! A signed block is `[u8 variant][subject][u8 audit?][audit][u8 compressed?][compressed]`
//! followed, for every variant but [`SignatureVariant::None`], by
//! `[u32 len signer identity][i64 signing time][u32 len proof]`. The proof
//! covers every byte before its own length prefix.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use rolesync_core::{
    Audit, CompressedBlock, CoreError, Decode, Ed25519PublicKey, Ed25519Signature, Encode,
    HostIdentifier, Identifier, Keypair, Time, WireReader, WireWriter,
};

use crate::error::{EnvelopeError, Result};

/// Who vouches for an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignatureVariant {
    /// Unsigned slot.
    None = 0,
    /// Signed by the host's key.
    Host = 1,
    /// Signed by a client's commitment key.
    Client = 2,
    /// Signed with a credential set.
    Credentials = 3,
}

impl SignatureVariant {
    pub fn from_u8(tag: u8) -> rolesync_core::Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Host),
            2 => Ok(Self::Client),
            3 => Ok(Self::Credentials),
            tag => Err(CoreError::InvalidTag {
                field: "signature variant",
                tag,
            }),
        }
    }

    pub fn is_signed(&self) -> bool {
        *self != Self::None
    }
}

/// Produces proofs for one signer identity.
pub trait Signer: Send + Sync {
    fn variant(&self) -> SignatureVariant;

    /// Bytes identifying the signer (host name, commitment key, credential id).
    fn identity(&self) -> Bytes;

    fn sign(&self, message: &[u8]) -> Result<Bytes>;
}

/// Checks proofs produced by a [`Signer`].
pub trait Verifier: Send + Sync {
    fn verify(
        &self,
        variant: SignatureVariant,
        identity: &[u8],
        message: &[u8],
        proof: &[u8],
    ) -> Result<()>;
}

/// The trailer of a signed element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seal {
    pub signer: Bytes,
    pub time: Time,
    pub proof: Bytes,
}

/// One element of an envelope at the signature layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlock {
    pub variant: SignatureVariant,
    pub subject: Identifier,
    pub audit: Option<Audit>,
    pub compressed: Option<CompressedBlock>,
    /// Present exactly when `variant` is signed.
    pub seal: Option<Seal>,
}

impl SignedBlock {
    pub fn unsigned(
        subject: Identifier,
        audit: Option<Audit>,
        compressed: Option<CompressedBlock>,
    ) -> Self {
        Self {
            variant: SignatureVariant::None,
            subject,
            audit,
            compressed,
            seal: None,
        }
    }

    /// Build and sign a block.
    pub fn sign(
        subject: Identifier,
        audit: Option<Audit>,
        compressed: Option<CompressedBlock>,
        signer: &dyn Signer,
        time: Time,
    ) -> Result<Self> {
        let variant = signer.variant();
        if !variant.is_signed() {
            return Ok(Self::unsigned(subject, audit, compressed));
        }
        let mut block = Self {
            variant,
            subject,
            audit,
            compressed,
            seal: Some(Seal {
                signer: signer.identity(),
                time,
                proof: Bytes::new(),
            }),
        };
        let proof = signer.sign(&block.signed_message())?;
        if let Some(seal) = block.seal.as_mut() {
            seal.proof = proof;
        }
        Ok(block)
    }

    fn write_body(&self, w: &mut WireWriter) {
        w.put_u8(self.variant as u8);
        w.put_identifier(&self.subject);
        w.put_option(self.audit.as_ref());
        w.put_option(self.compressed.as_ref());
    }

    /// The bytes the proof covers.
    pub fn signed_message(&self) -> Bytes {
        let mut w = WireWriter::new();
        self.write_body(&mut w);
        if let Some(seal) = &self.seal {
            w.put_bytes(&seal.signer);
            w.put_i64(seal.time.0);
        }
        w.finish()
    }

    /// Full signature check.
    pub fn verify(&self, verifier: &dyn Verifier) -> Result<()> {
        match (&self.seal, self.variant.is_signed()) {
            (None, false) => Ok(()),
            (Some(seal), true) => verifier.verify(
                self.variant,
                &seal.signer,
                &self.signed_message(),
                &seal.proof,
            ),
            _ => Err(EnvelopeError::MissingSigner),
        }
    }

    /// The signer identity, if the block is signed.
    pub fn signer(&self) -> Option<&Bytes> {
        self.seal.as_ref().map(|s| &s.signer)
    }

    /// Same variant and same signer identity.
    pub fn signed_alike(&self, other: &SignedBlock) -> bool {
        self.variant == other.variant && self.signer() == other.signer()
    }
}

impl Encode for SignedBlock {
    fn encode_to(&self, w: &mut WireWriter) {
        self.write_body(w);
        if let Some(seal) = &self.seal {
            w.put_bytes(&seal.signer);
            w.put_i64(seal.time.0);
            w.put_bytes(&seal.proof);
        }
    }
}

impl Decode for SignedBlock {
    fn decode_from(r: &mut WireReader<'_>) -> rolesync_core::Result<Self> {
        let variant = SignatureVariant::from_u8(r.get_u8()?)?;
        let subject = r.get_identifier()?;
        let audit = r.get_option("audit present")?;
        let compressed = r.get_option("content present")?;
        let seal = if variant.is_signed() {
            let signer = Bytes::copy_from_slice(r.get_bytes()?);
            let time = Time(r.get_i64()?);
            let proof = Bytes::copy_from_slice(r.get_bytes()?);
            Some(Seal {
                signer,
                time,
                proof,
            })
        } else {
            None
        };
        Ok(Self {
            variant,
            subject,
            audit,
            compressed,
            seal,
        })
    }
}

/// An ed25519-backed signer.
#[derive(Debug, Clone)]
pub struct KeypairSigner {
    variant: SignatureVariant,
    identity: Bytes,
    keypair: Keypair,
}

impl KeypairSigner {
    pub fn new(variant: SignatureVariant, identity: Bytes, keypair: Keypair) -> Self {
        Self {
            variant,
            identity,
            keypair,
        }
    }

    /// A host signing as itself.
    pub fn host(host: &HostIdentifier, keypair: Keypair) -> Self {
        Self::new(
            SignatureVariant::Host,
            Bytes::copy_from_slice(host.as_str().as_bytes()),
            keypair,
        )
    }

    /// A client whose identity is its commitment key.
    pub fn client(keypair: Keypair) -> Self {
        let identity = Bytes::copy_from_slice(keypair.public_key().as_bytes());
        Self::new(SignatureVariant::Client, identity, keypair)
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.keypair.public_key()
    }
}

impl Signer for KeypairSigner {
    fn variant(&self) -> SignatureVariant {
        self.variant
    }

    fn identity(&self) -> Bytes {
        self.identity.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.keypair.sign(message).as_bytes()))
    }
}

/// Verifies ed25519 proofs against a table of known signer keys.
///
/// Client identities are commitment keys and verify against themselves;
/// host and credential identities must be registered.
#[derive(Debug, Default)]
pub struct KeyTableVerifier {
    keys: RwLock<HashMap<(SignatureVariant, Bytes), Ed25519PublicKey>>,
}

impl KeyTableVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, variant: SignatureVariant, identity: Bytes, key: Ed25519PublicKey) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert((variant, identity), key);
        }
    }

    pub fn insert_host(&self, host: &HostIdentifier, key: Ed25519PublicKey) {
        self.insert(
            SignatureVariant::Host,
            Bytes::copy_from_slice(host.as_str().as_bytes()),
            key,
        );
    }

    fn lookup(&self, variant: SignatureVariant, identity: &[u8]) -> Result<Ed25519PublicKey> {
        if variant == SignatureVariant::Client {
            let arr: [u8; 32] = identity
                .try_into()
                .map_err(|_| EnvelopeError::BadSignature("malformed commitment key".into()))?;
            return Ok(Ed25519PublicKey::from_bytes(arr));
        }
        let keys = self
            .keys
            .read()
            .map_err(|_| EnvelopeError::BadSignature("key table poisoned".into()))?;
        keys.get(&(variant, Bytes::copy_from_slice(identity)))
            .copied()
            .ok_or_else(|| {
                EnvelopeError::BadSignature(format!(
                    "unknown {variant:?} signer {}",
                    String::from_utf8_lossy(identity)
                ))
            })
    }
}

impl Verifier for KeyTableVerifier {
    fn verify(
        &self,
        variant: SignatureVariant,
        identity: &[u8],
        message: &[u8],
        proof: &[u8],
    ) -> Result<()> {
        let key = self.lookup(variant, identity)?;
        let signature = Ed25519Signature::from_slice(proof)
            .map_err(|e| EnvelopeError::BadSignature(e.to_string()))?;
        key.verify(message, &signature)
            .map_err(|e| EnvelopeError::BadSignature(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_core::{ContentBlock, TypeIdentifier};

    fn subject() -> Identifier {
        Identifier::new("alice@host.test").unwrap()
    }

    fn compressed() -> CompressedBlock {
        CompressedBlock::stored(&ContentBlock::new(
            TypeIdentifier::from_static("note@test"),
            &b"hi"[..],
        ))
    }

    #[test]
    fn test_client_block_verifies() {
        let signer = KeypairSigner::client(Keypair::from_seed(&[1; 32]));
        let block =
            SignedBlock::sign(subject(), None, Some(compressed()), &signer, Time(42)).unwrap();

        let decoded = SignedBlock::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(decoded, block);
        decoded.verify(&KeyTableVerifier::new()).unwrap();
    }

    #[test]
    fn test_tampered_block_fails() {
        let signer = KeypairSigner::client(Keypair::from_seed(&[1; 32]));
        let mut block =
            SignedBlock::sign(subject(), None, Some(compressed()), &signer, Time(42)).unwrap();
        block.subject = Identifier::new("mallory@host.test").unwrap();
        assert!(matches!(
            block.verify(&KeyTableVerifier::new()),
            Err(EnvelopeError::BadSignature(_))
        ));
    }

    #[test]
    fn test_unknown_host_rejected() {
        let host = HostIdentifier::new("host.test").unwrap();
        let signer = KeypairSigner::host(&host, Keypair::from_seed(&[2; 32]));
        let block = SignedBlock::sign(subject(), None, None, &signer, Time(1)).unwrap();

        let verifier = KeyTableVerifier::new();
        assert!(block.verify(&verifier).is_err());

        verifier.insert_host(&host, signer.public_key());
        block.verify(&verifier).unwrap();
    }

    #[test]
    fn test_unsigned_layout() {
        let block = SignedBlock::unsigned(Identifier::new("h").unwrap(), None, None);
        assert_eq!(block.to_bytes().as_ref(), &[0, 1, b'h', 0, 0]);
        block.verify(&KeyTableVerifier::new()).unwrap();
    }

    #[test]
    fn test_signed_alike() {
        let a = KeypairSigner::client(Keypair::from_seed(&[1; 32]));
        let b = KeypairSigner::client(Keypair::from_seed(&[2; 32]));
        let x = SignedBlock::sign(subject(), None, None, &a, Time(1)).unwrap();
        let y = SignedBlock::sign(subject(), None, Some(compressed()), &a, Time(2)).unwrap();
        let z = SignedBlock::sign(subject(), None, None, &b, Time(1)).unwrap();
        assert!(x.signed_alike(&y));
        assert!(!x.signed_alike(&z));
    }
}
