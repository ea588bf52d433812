//! Byte-exact wire primitives.
//!
//! Every block exchanged with a host is built from these primitives so that
//! the same value always produces identical bytes:
//! - Integers are big-endian with fixed width
//! - Identifiers are `u8`-length-prefixed UTF-8
//! - Byte strings are `u32`-length-prefixed
//! - Optional fields carry a `0`/`1` presence byte
//!
//! Decoding is strict: unknown tags, truncated input and trailing bytes are
//! all errors.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};
use crate::types::{HostIdentifier, Identifier, TypeIdentifier, MAX_IDENTIFIER_LEN};

/// Largest byte string accepted by [`WireReader::get_bytes`] (16 MiB).
pub const MAX_BYTES_LEN: usize = 16 * 1024 * 1024;

/// Append-only writer for wire blocks.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Raw bytes without a length prefix (fixed-size fields).
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// A `u32`-length-prefixed byte string.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    /// A `u8`-length-prefixed identifier string.
    ///
    /// Identifier newtypes guarantee the length fits.
    pub fn put_name(&mut self, name: &str) {
        debug_assert!(name.len() <= MAX_IDENTIFIER_LEN);
        self.buf.put_u8(name.len() as u8);
        self.buf.put_slice(name.as_bytes());
    }

    pub fn put_identifier(&mut self, id: &Identifier) {
        self.put_name(id.as_str());
    }

    pub fn put_host(&mut self, host: &HostIdentifier) {
        self.put_name(host.as_str());
    }

    pub fn put_type(&mut self, type_id: &TypeIdentifier) {
        self.put_name(type_id.as_str());
    }

    /// Encode a nested block in place.
    pub fn put<T: Encode + ?Sized>(&mut self, value: &T) {
        value.encode_to(self);
    }

    /// Encode an optional nested block behind a presence byte.
    pub fn put_option<T: Encode>(&mut self, value: Option<&T>) {
        match value {
            Some(v) => {
                self.put_bool(true);
                v.encode_to(self);
            }
            None => self.put_bool(false),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Strict cursor over an encoded block.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// The unread tail of the input.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn need(&self, needed: usize) -> Result<()> {
        if self.buf.len() < needed {
            return Err(CoreError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn get_bool(&mut self, field: &'static str) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CoreError::InvalidTag { field, tag }),
        }
    }

    /// Exactly `len` raw bytes.
    pub fn get_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let raw = self.get_raw(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(raw);
        Ok(arr)
    }

    /// A `u32`-length-prefixed byte string.
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        if len > MAX_BYTES_LEN {
            return Err(CoreError::LengthExceeded {
                len,
                limit: MAX_BYTES_LEN,
            });
        }
        self.get_raw(len)
    }

    /// A `u8`-length-prefixed identifier string.
    pub fn get_name(&mut self) -> Result<&'a str> {
        let len = self.get_u8()? as usize;
        let raw = self.get_raw(len)?;
        std::str::from_utf8(raw).map_err(|e| CoreError::InvalidIdentifier(e.to_string()))
    }

    pub fn get_identifier(&mut self) -> Result<Identifier> {
        Identifier::new(self.get_name()?)
    }

    pub fn get_host(&mut self) -> Result<HostIdentifier> {
        HostIdentifier::new(self.get_name()?)
    }

    pub fn get_type(&mut self) -> Result<TypeIdentifier> {
        TypeIdentifier::new(self.get_name()?)
    }

    pub fn get<T: Decode>(&mut self) -> Result<T> {
        T::decode_from(self)
    }

    pub fn get_option<T: Decode>(&mut self, field: &'static str) -> Result<Option<T>> {
        if self.get_bool(field)? {
            Ok(Some(T::decode_from(self)?))
        } else {
            Ok(None)
        }
    }

    /// Fail unless the input has been fully consumed.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CoreError::TrailingBytes(self.buf.len()))
        }
    }
}

/// A value with a byte-exact wire encoding.
pub trait Encode {
    fn encode_to(&self, writer: &mut WireWriter);

    fn to_bytes(&self) -> Bytes {
        let mut writer = WireWriter::new();
        self.encode_to(&mut writer);
        writer.finish()
    }
}

/// A value that can be strictly decoded from its wire encoding.
pub trait Decode: Sized {
    fn decode_from(reader: &mut WireReader<'_>) -> Result<Self>;

    /// Decode a value that must span the whole input.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let value = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_big_endian() {
        let mut w = WireWriter::new();
        w.put_u16(0x0102);
        w.put_u32(0x0304_0506);
        w.put_i64(-1);
        assert_eq!(
            w.as_slice(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_name_is_u8_prefixed() {
        let mut w = WireWriter::new();
        w.put_identifier(&Identifier::new("a@b").unwrap());
        assert_eq!(w.as_slice(), &[3, b'a', b'@', b'b']);

        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.get_identifier().unwrap().as_str(), "a@b");
        r.finish().unwrap();
    }

    #[test]
    fn test_bytes_are_u32_prefixed() {
        let mut w = WireWriter::new();
        w.put_bytes(b"xyz");
        assert_eq!(w.as_slice(), &[0, 0, 0, 3, b'x', b'y', b'z']);
    }

    #[test]
    fn test_truncated_input() {
        let mut r = WireReader::new(&[0, 0, 0, 9, 1, 2]);
        assert!(matches!(
            r.get_bytes(),
            Err(CoreError::Truncated { needed: 9, remaining: 2 })
        ));
    }

    #[test]
    fn test_invalid_bool_tag() {
        let mut r = WireReader::new(&[2]);
        assert!(matches!(
            r.get_bool("flag"),
            Err(CoreError::InvalidTag { field: "flag", tag: 2 })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let r = WireReader::new(&[1]);
        assert!(matches!(r.finish(), Err(CoreError::TrailingBytes(1))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut r = WireReader::new(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(r.get_bytes(), Err(CoreError::LengthExceeded { .. })));
    }
}
