//! The compression layer wrapping exactly one content block.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::content::ContentBlock;
use crate::error::{CoreError, Result};
use crate::wire::{Decode, Encode, WireReader, WireWriter, MAX_BYTES_LEN};

/// Compression algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Algorithm {
    None = 0,
    Zlib = 1,
}

impl Algorithm {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            tag => Err(CoreError::InvalidTag {
                field: "compression algorithm",
                tag,
            }),
        }
    }
}

/// `[u8 algorithm][u32 len][data]`, where `data` is the encoded content
/// block, deflated when the algorithm is zlib.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlock {
    pub algorithm: Algorithm,
    pub data: Bytes,
}

impl CompressedBlock {
    /// Wrap a content block. It is stored as is only when its payload is
    /// empty and no audit travels in the same element.
    pub fn compress(content: &ContentBlock, with_audit: bool) -> Result<Self> {
        if content.is_empty() && !with_audit {
            return Ok(Self::stored(content));
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&content.to_bytes())
            .map_err(|e| CoreError::Compression(e.to_string()))?;
        let data = encoder
            .finish()
            .map_err(|e| CoreError::Compression(e.to_string()))?;
        Ok(Self {
            algorithm: Algorithm::Zlib,
            data: data.into(),
        })
    }

    /// Wrap a content block without deflating it.
    pub fn stored(content: &ContentBlock) -> Self {
        Self {
            algorithm: Algorithm::None,
            data: content.to_bytes(),
        }
    }

    /// Recover the inner content block.
    pub fn decompress(&self) -> Result<ContentBlock> {
        match self.algorithm {
            Algorithm::None => ContentBlock::from_bytes(&self.data),
            Algorithm::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(self.data.as_ref())
                    .take(MAX_BYTES_LEN as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| CoreError::Compression(e.to_string()))?;
                if out.len() > MAX_BYTES_LEN {
                    return Err(CoreError::LengthExceeded {
                        len: out.len(),
                        limit: MAX_BYTES_LEN,
                    });
                }
                ContentBlock::from_bytes(&out)
            }
        }
    }
}

impl Encode for CompressedBlock {
    fn encode_to(&self, w: &mut WireWriter) {
        w.put_u8(self.algorithm as u8);
        w.put_bytes(&self.data);
    }
}

impl Decode for CompressedBlock {
    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        let algorithm = Algorithm::from_u8(r.get_u8()?)?;
        let data = Bytes::copy_from_slice(r.get_bytes()?);
        Ok(Self { algorithm, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeIdentifier;

    fn block(payload: &'static [u8]) -> ContentBlock {
        ContentBlock::new(TypeIdentifier::from_static("note@test"), payload)
    }

    #[test]
    fn test_zlib_roundtrip() {
        let content = block(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let compressed = CompressedBlock::compress(&content, false).unwrap();
        assert_eq!(compressed.algorithm, Algorithm::Zlib);
        assert_eq!(compressed.decompress().unwrap(), content);
    }

    #[test]
    fn test_empty_payload_is_stored() {
        let content = block(b"");
        let compressed = CompressedBlock::compress(&content, false).unwrap();
        assert_eq!(compressed.algorithm, Algorithm::None);
        assert_eq!(compressed.data, content.to_bytes());
    }

    #[test]
    fn test_empty_payload_beside_audit_is_deflated() {
        let content = block(b"");
        let compressed = CompressedBlock::compress(&content, true).unwrap();
        assert_eq!(compressed.algorithm, Algorithm::Zlib);
        assert_eq!(compressed.decompress().unwrap(), content);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let bytes = [7u8, 0, 0, 0, 0];
        assert!(matches!(
            CompressedBlock::from_bytes(&bytes),
            Err(CoreError::InvalidTag { tag: 7, .. })
        ));
    }

    #[test]
    fn test_corrupt_zlib_rejected() {
        let compressed = CompressedBlock {
            algorithm: Algorithm::Zlib,
            data: Bytes::from_static(b"not zlib"),
        };
        assert!(compressed.decompress().is_err());
    }
}
