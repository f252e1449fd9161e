//! Canonical binary encoding
//!
//! One encoding is shared by wire messages and on-disk values:
//! - fixed-width big-endian integers
//! - `u32` length prefix for blobs and strings
//! - `u32` count prefix for collections
//! - `u8` presence flag for options, `u8` tag for enum variants
//!
//! Every type that crosses the wire or lands in a table implements
//! [`Encode`] and [`Decode`], and `decode(encode(x)) == x` bit-for-bit.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("unknown {kind} tag {tag}")]
    UnknownTag { kind: &'static str, tag: u8 },
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Canonical encoder.
pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);

    /// Encode into a fresh immutable buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Canonical decoder. `decode` consumes from the front of `buf`.
pub trait Decode: Sized {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError>;

    /// Decode a complete value, rejecting trailing bytes.
    fn from_bytes(bytes: Bytes) -> Result<Self, CodecError> {
        let mut buf = bytes;
        let value = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }
        Ok(value)
    }

    /// Decode a complete value from a borrowed slice (copies once).
    fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::from_bytes(Bytes::copy_from_slice(bytes))
    }
}

/// Fail with `Truncated` unless `needed` bytes remain.
pub fn ensure(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated { needed, remaining: buf.remaining() });
    }
    Ok(())
}

/// Read an enum tag.
pub fn get_tag(buf: &mut Bytes) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

/// Read a `u32` length or count prefix.
fn get_len(buf: &mut Bytes) -> Result<usize, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32() as usize)
}

fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u32(len as u32);
}

// ==================== Primitives ====================

macro_rules! impl_int {
    ($ty:ty, $size:expr, $put:ident, $get:ident) => {
        impl Encode for $ty {
            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl Decode for $ty {
            fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
                ensure(buf, $size)?;
                Ok(buf.$get())
            }
        }
    };
}

impl_int!(u8, 1, put_u8, get_u8);
impl_int!(u32, 4, put_u32, get_u32);
impl_int!(u64, 8, put_u64, get_u64);
impl_int!(i32, 4, put_i32, get_i32);
impl_int!(i64, 8, put_i64, get_i64);

impl Encode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_tag(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::UnknownTag { kind: "bool", tag }),
        }
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_str().encode(buf);
    }
}

impl Encode for str {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        buf.put_slice(self.as_bytes());
    }
}

impl Decode for String {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let len = get_len(buf)?;
        ensure(buf, len)?;
        let raw = buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl Encode for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        buf.put_slice(self);
    }
}

impl Decode for Bytes {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let len = get_len(buf)?;
        ensure(buf, len)?;
        Ok(buf.split_to(len))
    }
}

// ==================== Composites ====================

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_u8(0),
            Some(value) => {
                buf.put_u8(1);
                value.encode(buf);
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_tag(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(buf)?)),
            tag => Err(CodecError::UnknownTag { kind: "option", tag }),
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let count = get_len(buf)?;
        // Every element takes at least one byte; don't trust the count for allocation.
        let mut items = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<T: Encode> Encode for BTreeSet<T> {
    fn encode(&self, buf: &mut BytesMut) {
        put_len(buf, self.len());
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decode + Ord> Decode for BTreeSet<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let count = get_len(buf)?;
        let mut items = BTreeSet::new();
        for _ in 0..count {
            items.insert(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
        self.1.encode(buf);
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok((A::decode(buf)?, B::decode(buf)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        assert_eq!(&0x0102_0304u32.to_bytes()[..], &[1, 2, 3, 4]);
        assert_eq!(&(-1i32).to_bytes()[..], &[0xff; 4]);
        assert_eq!(&7u64.to_bytes()[..], &[0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn strings_are_length_prefixed() {
        let bytes = "ab".to_string().to_bytes();
        assert_eq!(&bytes[..], &[0, 0, 0, 2, b'a', b'b']);
        assert_eq!(String::from_bytes(bytes).unwrap(), "ab");
    }

    #[test]
    fn truncated_input_is_an_error() {
        let err = u64::from_slice(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, CodecError::Truncated { needed: 8, remaining: 3 });

        // Length prefix claims more bytes than are present
        let err = String::from_slice(&[0, 0, 0, 9, b'x']).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 9, .. }));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let err = i32::from_slice(&[0, 0, 0, 1, 0xAA]).unwrap_err();
        assert_eq!(err, CodecError::TrailingBytes(1));
    }

    #[test]
    fn huge_count_does_not_preallocate() {
        // count = u32::MAX but no payload: must fail cleanly, not abort on allocation
        let err = Vec::<u64>::from_slice(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn option_and_set() {
        let value: Option<BTreeSet<i32>> = Some([3, 1, 2].into_iter().collect());
        let bytes = value.to_bytes();
        // flag, count, then sorted elements
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 3]);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 1]);
        assert_eq!(Option::<BTreeSet<i32>>::from_bytes(bytes).unwrap(), value);

        assert!(matches!(
            Option::<u8>::from_slice(&[7]),
            Err(CodecError::UnknownTag { kind: "option", tag: 7 })
        ));
    }
}
