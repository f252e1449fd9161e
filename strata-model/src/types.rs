//! Strong types for overlay coordinates and peer-level identifiers
//!
//! Semantic newtypes replacing raw `[u8; N]`, `String` and `i32`.

use crate::codec::{ensure, CodecError, Decode, Encode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Macro to define fixed-size byte arrays with strong types.
///
/// Args:
/// - $name: The name of the struct (e.g., Id)
/// - $len: The size of the array (e.g., 32)
/// - $doc: Documentation string
/// - $derives: List of traits to derive
macro_rules! define_bytes {
    ($name:ident, $len:expr, $doc:expr, [$($derives:ident),*]) => {
        #[doc = $doc]
        #[derive(Clone, Copy, $($derives),*)]
        #[repr(transparent)]
        pub struct $name(pub [u8; $len]);

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        // Zero-allocation Hex formatting
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(self, f)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short form is enough to tell ring positions apart in logs
                write!(f, "{}({}..)", stringify!($name), hex::encode(&self.0[..4]))
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;
            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                Ok(Self(<[u8; $len]>::try_from(slice)?))
            }
        }

        impl Encode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                buf.put_slice(&self.0);
            }
        }

        impl Decode for $name {
            fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
                ensure(buf, $len)?;
                let mut arr = [0u8; $len];
                buf.copy_to_slice(&mut arr);
                Ok(Self(arr))
            }
        }
    };
}

// --- Type Definitions ---

define_bytes!(
    Id,
    32,
    "32-byte overlay coordinate (BLAKE3 digest space), ordered around the ring",
    [PartialEq, Eq, Hash, Default, PartialOrd, Ord]
);

impl Id {
    pub const LEN: usize = 32;
    /// Origin of the ring.
    pub const MIN: Id = Id([0u8; 32]);
    /// Last coordinate before wrapping back to [`Id::MIN`].
    pub const MAX: Id = Id([0xffu8; 32]);

    /// Content-derived coordinate.
    pub fn digest(content: &[u8]) -> Id {
        Id(*blake3::hash(content).as_bytes())
    }
}

/// Opaque peer name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl Encode for PeerId {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl Decode for PeerId {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self(String::decode(buf)?))
    }
}

/// Number naming one immutable published batch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct Epoch(pub i32);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch#{}", self.0)
    }
}

impl Encode for Epoch {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl Decode for Epoch {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self(i32::decode(buf)?))
    }
}

// --- Tests ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let id = Id([0xab; 32]);
        let expected = "ab".repeat(32);
        assert_eq!(format!("{}", id), expected);
        assert_eq!(format!("{:?}", id), "Id(abababab..)");
    }

    #[test]
    fn test_id_ordering_bounds() {
        let id = Id::digest(b"anything");
        assert!(Id::MIN <= id && id <= Id::MAX);
        assert!(Id::MIN < Id::MAX);
    }

    #[test]
    fn test_id_codec_is_raw_bytes() {
        let id = Id([7; 32]);
        let bytes = id.to_bytes();
        assert_eq!(bytes.len(), Id::LEN);
        assert_eq!(Id::from_bytes(bytes).unwrap(), id);
    }

    #[test]
    fn test_epoch_next_saturates() {
        assert_eq!(Epoch(4).next(), Epoch(5));
        assert_eq!(Epoch(i32::MAX).next(), Epoch(i32::MAX));
    }
}
