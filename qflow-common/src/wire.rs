//! Canonical wire format.
//!
//! Every ledger entry, peer message, and state value that crosses a
//! component boundary is encoded through this module: fixed field order,
//! length-prefixed byte strings, an explicit leading version byte. The
//! ledger's chain hash is computed over this encoding, so two
//! independent implementations that preserve byte-exact canonicalization
//! converge on the same hash.

use sha2::{Digest, Sha256};
use std::convert::TryInto;
use thiserror::Error;

/// Version byte prefixed to every top-level canonical encoding.
pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReaderError {
    #[error("unexpected end of buffer")]
    Eof,
    #[error("invalid tag or value in encoded field")]
    InvalidValue,
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
}

/// A read cursor over a canonically-encoded byte slice.
pub struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ReaderError> {
        if self.remaining() < n {
            return Err(ReaderError::Eof);
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a length-prefixed (u32) byte string.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, ReaderError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, ReaderError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| ReaderError::InvalidValue)
    }

    pub fn expect_version(&mut self) -> Result<(), ReaderError> {
        let v = self.read_u8()?;
        if v != WIRE_VERSION {
            return Err(ReaderError::UnsupportedVersion(v));
        }
        Ok(())
    }
}

/// A canonical encoding sink. Field order is always the declaration order of
/// the struct being encoded; there is no reordering or sorting performed
/// here, which is what makes the format canonical.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_version(&mut self) {
        self.buf.push(WIRE_VERSION);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn write_string(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }
}

/// Implemented by every type that can cross a component boundary.
pub trait Serializer: Sized {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;
    fn write(&self, writer: &mut Writer);

    /// Encodes `self` with the leading version byte.
    fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_version();
        self.write(&mut w);
        w.into_bytes()
    }

    fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut r = Reader::new(bytes);
        r.expect_version()?;
        Self::read(&mut r)
    }
}

impl Serializer for u64 {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self)
    }
}

impl Serializer for String {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_string()
    }
    fn write(&self, writer: &mut Writer) {
        writer.write_string(self)
    }
}

/// SHA-256 over the canonical encoding of `value`, matching the ledger's
/// `H(prev_hash ‖ canonical(fields))` hash construction.
pub fn canonical_hash<T: Serializer>(value: &T) -> [u8; 32] {
    let bytes = value.to_canonical_bytes();
    let digest = Sha256::digest(&bytes);
    digest.into()
}

/// SHA-256 over raw bytes with no canonical framing, used where the input
/// is already an opaque blob rather than a `Serializer` value (e.g. a
/// compiled module's content hash).
pub fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// `H(prefix ‖ canonical(fields))`, the exact chaining operation used by the
/// ledger: the previous entry's hash is prefixed onto the new entry's
/// canonical bytes before hashing.
pub fn chained_hash(prev_hash: &[u8; 32], canonical_fields: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(canonical_fields);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_u64_string() {
        let mut w = Writer::new();
        42u64.write(&mut w);
        "hello".to_string().write(&mut w);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(u64::read(&mut r).unwrap(), 42);
        assert_eq!(String::read(&mut r).unwrap(), "hello");
    }

    #[test]
    fn canonical_roundtrip_has_version_byte() {
        let encoded = 7u64.to_canonical_bytes();
        assert_eq!(encoded[0], WIRE_VERSION);
        assert_eq!(u64::from_canonical_bytes(&encoded).unwrap(), 7);
    }

    #[test]
    fn chained_hash_is_sensitive_to_prev_hash() {
        let fields = b"payload".to_vec();
        let h1 = chained_hash(&[0u8; 32], &fields);
        let h2 = chained_hash(&[1u8; 32], &fields);
        assert_ne!(h1, h2);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut bytes = 9u64.to_canonical_bytes();
        bytes[0] = 0xFF;
        let err = u64::from_canonical_bytes(&bytes).unwrap_err();
        assert_eq!(err, ReaderError::UnsupportedVersion(0xFF));
    }
}
