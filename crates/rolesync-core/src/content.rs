//! Typed, self-describing content blocks.

use bytes::Bytes;

use crate::crypto::Blake3Hash;
use crate::error::Result;
use crate::types::TypeIdentifier;
use crate::wire::{Decode, Encode, WireReader, WireWriter};

/// A typed binary value: method parameters, a reply payload or an error
/// descriptor. The payload shape is defined by whoever owns `type_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentBlock {
    pub type_id: TypeIdentifier,
    pub payload: Bytes,
}

impl ContentBlock {
    pub fn new(type_id: TypeIdentifier, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            payload: payload.into(),
        }
    }

    /// A block with no payload (e.g. a bare query).
    pub fn empty(type_id: TypeIdentifier) -> Self {
        Self::new(type_id, Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_type(&self, type_id: &TypeIdentifier) -> bool {
        &self.type_id == type_id
    }

    /// Digest of the encoded block.
    pub fn digest(&self) -> Blake3Hash {
        Blake3Hash::hash(&self.to_bytes())
    }
}

impl Encode for ContentBlock {
    fn encode_to(&self, w: &mut WireWriter) {
        w.put_type(&self.type_id);
        w.put_bytes(&self.payload);
    }
}

impl Decode for ContentBlock {
    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        let type_id = r.get_type()?;
        let payload = Bytes::copy_from_slice(r.get_bytes()?);
        Ok(Self { type_id, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let block = ContentBlock::new(TypeIdentifier::from_static("a@b"), &b"hi"[..]);
        assert_eq!(
            block.to_bytes().as_ref(),
            &[3, b'a', b'@', b'b', 0, 0, 0, 2, b'h', b'i']
        );
        assert_eq!(ContentBlock::from_bytes(&block.to_bytes()).unwrap(), block);
    }

    #[test]
    fn test_digest_depends_on_type() {
        let a = ContentBlock::new(TypeIdentifier::from_static("a@x"), &b"p"[..]);
        let b = ContentBlock::new(TypeIdentifier::from_static("b@x"), &b"p"[..]);
        assert_ne!(a.digest(), b.digest());
    }
}
