//! Network message types.
//!
//! Every key carried here is the hashed network key, never the
//! application key.

use bytes::{Bytes, BytesMut};
use hoard_core::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Announces a stream of encrypted file bytes
    StoreFile = 1,
    /// Asks the receiver to serve a file
    GetFile = 2,
    /// Positive reply to `GetFile`, stream follows
    ServeFile = 3,
    /// Negative reply to `GetFile`
    NotFound = 4,
}

impl MessageType {
    /// Returns the tag value.
    pub fn tag(&self) -> u32 {
        *self as u32
    }

    /// Creates from a tag value.
    pub fn from_tag(tag: u32) -> Result<Self, DecodeError> {
        match tag {
            1 => Ok(MessageType::StoreFile),
            2 => Ok(MessageType::GetFile),
            3 => Ok(MessageType::ServeFile),
            4 => Ok(MessageType::NotFound),
            _ => Err(DecodeError::UnknownMessageTag(tag)),
        }
    }
}

/// Correlates a `GetFile` with its replies.
pub type RequestId = u64;

/// Control message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `size` encrypted bytes for `key` follow as a stream frame.
    StoreFile {
        /// Hashed key
        key: String,
        /// Stream length, IV included
        size: u64,
    },
    /// Requests that the receiving peer serve `key`.
    GetFile {
        /// Correlation identifier
        request_id: RequestId,
        /// Hashed key
        key: String,
    },
    /// The peer serves `key`; `size` encrypted bytes follow as a stream frame.
    ServeFile {
        /// Identifier of the `GetFile` being answered
        request_id: RequestId,
        /// Hashed key
        key: String,
        /// Stream length, IV included
        size: u64,
    },
    /// The peer does not hold `key`.
    NotFound {
        /// Identifier of the `GetFile` being answered
        request_id: RequestId,
        /// Hashed key
        key: String,
    },
}

impl Message {
    /// Returns the message type.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::StoreFile { .. } => MessageType::StoreFile,
            Message::GetFile { .. } => MessageType::GetFile,
            Message::ServeFile { .. } => MessageType::ServeFile,
            Message::NotFound { .. } => MessageType::NotFound,
        }
    }

    /// Returns the hashed key the message refers to.
    pub fn key(&self) -> &str {
        match self {
            Message::StoreFile { key, .. }
            | Message::GetFile { key, .. }
            | Message::ServeFile { key, .. }
            | Message::NotFound { key, .. } => key,
        }
    }

    /// Returns the length of the stream frame that follows, if any.
    pub fn stream_size(&self) -> Option<u64> {
        match self {
            Message::StoreFile { size, .. } | Message::ServeFile { size, .. } => Some(*size),
            _ => None,
        }
    }
}

impl CanonicalEncode for Message {
    fn encode(&self, buf: &mut BytesMut) {
        self.message_type().tag().encode(buf);
        match self {
            Message::StoreFile { key, size } => {
                key.encode(buf);
                size.encode(buf);
            }
            Message::GetFile { request_id, key } => {
                request_id.encode(buf);
                key.encode(buf);
            }
            Message::ServeFile {
                request_id,
                key,
                size,
            } => {
                request_id.encode(buf);
                key.encode(buf);
                size.encode(buf);
            }
            Message::NotFound { request_id, key } => {
                request_id.encode(buf);
                key.encode(buf);
            }
        }
    }
}

impl CanonicalDecode for Message {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let msg_type = MessageType::from_tag(u32::decode(buf)?)?;

        match msg_type {
            MessageType::StoreFile => Ok(Message::StoreFile {
                key: String::decode(buf)?,
                size: u64::decode(buf)?,
            }),
            MessageType::GetFile => Ok(Message::GetFile {
                request_id: RequestId::decode(buf)?,
                key: String::decode(buf)?,
            }),
            MessageType::ServeFile => Ok(Message::ServeFile {
                request_id: RequestId::decode(buf)?,
                key: String::decode(buf)?,
                size: u64::decode(buf)?,
            }),
            MessageType::NotFound => Ok(Message::NotFound {
                request_id: RequestId::decode(buf)?,
                key: String::decode(buf)?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_file_layout() {
        let msg = Message::StoreFile {
            key: "ab".to_string(),
            size: 16,
        };
        let encoded = msg.to_vec();
        assert_eq!(
            encoded,
            vec![
                0x01, 0x00, 0x00, 0x00, // tag
                0x02, 0x00, 0x00, 0x00, b'a', b'b', // key
                0x10, 0, 0, 0, 0, 0, 0, 0, // size
            ]
        );
    }

    #[test]
    fn test_every_variant_decodes() {
        let messages = [
            Message::StoreFile {
                key: "k1".to_string(),
                size: 1024,
            },
            Message::GetFile {
                request_id: 7,
                key: "k2".to_string(),
            },
            Message::ServeFile {
                request_id: 7,
                key: "k2".to_string(),
                size: 38,
            },
            Message::NotFound {
                request_id: 9,
                key: "k3".to_string(),
            },
        ];

        for msg in messages {
            let decoded = Message::from_bytes(&msg.to_vec()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_unknown_tag() {
        let result = Message::from_bytes(&[0x63, 0x00, 0x00, 0x00]);
        assert_eq!(result, Err(DecodeError::UnknownMessageTag(0x63)));
    }

    #[test]
    fn test_stream_size() {
        let store = Message::StoreFile {
            key: "k".to_string(),
            size: 42,
        };
        let get = Message::GetFile {
            request_id: 1,
            key: "k".to_string(),
        };
        assert_eq!(store.stream_size(), Some(42));
        assert_eq!(get.stream_size(), None);
        assert_eq!(get.key(), "k");
    }
}
