//! Byte-exact encoding of wire messages.
//!
//! Integers are little-endian and fixed width. A string is its UTF-8 byte
//! length as a `u32` followed by the bytes. Enums write a `u32` tag and
//! then their fields in declaration order, with no padding anywhere.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors while decoding a message body.
///
/// All of them are local to one message: the frame around it was read in
/// full, so the connection stays usable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The body ended in the middle of a field
    #[error("Truncated input: needed {needed} bytes, {remaining} left")]
    Truncated {
        /// Bytes the field needed
        needed: usize,
        /// Bytes left in the body
        remaining: usize,
    },

    /// A string field is not valid UTF-8
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// The message tag is not known to this version
    #[error("Unknown message tag: {0}")]
    UnknownMessageTag(u32),

    /// Bytes left over after the message
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Types with a canonical byte form.
pub trait CanonicalEncode {
    /// Appends the encoded form to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Encodes into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Encodes into a `Vec`.
    fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

/// Types that can be read back from their canonical byte form.
pub trait CanonicalDecode: Sized {
    /// Consumes one value from the front of `buf`.
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError>;

    /// Decodes a complete body. Leftover bytes are an error.
    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let value = Self::decode(&mut buf)?;
        match buf.remaining() {
            0 => Ok(value),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

fn need(buf: &Bytes, needed: usize) -> Result<(), DecodeError> {
    let remaining = buf.remaining();
    if remaining < needed {
        Err(DecodeError::Truncated { needed, remaining })
    } else {
        Ok(())
    }
}

macro_rules! le_integer {
    ($ty:ty, $put:ident, $get:ident) => {
        impl CanonicalEncode for $ty {
            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl CanonicalDecode for $ty {
            fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
                need(buf, std::mem::size_of::<$ty>())?;
                Ok(buf.$get())
            }
        }
    };
}

le_integer!(u32, put_u32_le, get_u32_le);
le_integer!(u64, put_u64_le, get_u64_le);

impl CanonicalEncode for str {
    fn encode(&self, buf: &mut BytesMut) {
        // Keys are 32-character digests; anything near u32::MAX is a bug.
        debug_assert!(self.len() <= u32::MAX as usize);
        (self.len() as u32).encode(buf);
        buf.put_slice(self.as_bytes());
    }
}

impl CanonicalEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_str().encode(buf);
    }
}

impl CanonicalDecode for String {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u32::decode(buf)? as usize;
        need(buf, len)?;
        let raw = buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_little_endian() {
        assert_eq!(0x0a0b0c0du32.to_vec(), [0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(
            258u64.to_vec(),
            [0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let encoded = "key".to_string().to_vec();
        assert_eq!(encoded, [3, 0, 0, 0, b'k', b'e', b'y']);
        assert_eq!(String::from_bytes(&encoded).unwrap(), "key");
        assert_eq!(String::from_bytes(&[0, 0, 0, 0]).unwrap(), "");
    }

    #[test]
    fn test_truncated_string() {
        assert_eq!(
            String::from_bytes(&[4, 0, 0, 0, b'a', b'b']),
            Err(DecodeError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_truncated_integer() {
        assert_eq!(
            u64::from_bytes(&[1, 2, 3]),
            Err(DecodeError::Truncated {
                needed: 8,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let result = String::from_bytes(&[2, 0, 0, 0, 0xc3, 0x28]);
        assert!(matches!(result, Err(DecodeError::InvalidUtf8(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert_eq!(
            u32::from_bytes(&[7, 0, 0, 0, 0xff, 0xff]),
            Err(DecodeError::TrailingBytes(2))
        );
    }
}
