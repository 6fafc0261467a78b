//! Frame codec.
//!
//! Every unit written to a peer starts with a one-byte tag followed by a
//! length, so no frame shape is ambiguous:
//!
//! ```text
//! control: [0x01][u32 LE length][canonical Message]
//! stream:  [0x02][u64 LE length][raw bytes]
//! ```

use bytes::{BufMut, BytesMut};
use hoard_core::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Message;

/// Upper bound on an encoded control message.
pub const MAX_CONTROL_FRAME_SIZE: u32 = 1024 * 1024;

/// Discriminates control messages from raw byte streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    /// A control message follows
    Message = 0x01,
    /// A raw byte stream follows
    Stream = 0x02,
}

impl FrameTag {
    /// Returns the tag byte.
    pub fn byte(&self) -> u8 {
        *self as u8
    }

    /// Creates from a tag byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameTag::Message),
            0x02 => Some(FrameTag::Stream),
            _ => None,
        }
    }
}

/// Errors while reading a frame.
///
/// Everything except `Decode` leaves the byte stream unsynchronised and
/// should end the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    /// IO error, including EOF
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Tag byte is neither control nor stream
    #[error("Unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    /// Control frame exceeds `MAX_CONTROL_FRAME_SIZE`
    #[error("Control frame too large: {0} bytes")]
    TooLarge(u32),

    /// Control frame body is not a valid message
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl FrameError {
    /// Returns true if the connection can keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Decode(_))
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// Control message of the given encoded length
    Message(u32),
    /// Raw stream of the given length
    Stream(u64),
}

/// Encodes a control frame into a single buffer.
pub fn encode_message(msg: &Message) -> BytesMut {
    let body = msg.to_bytes();
    let mut buf = BytesMut::with_capacity(1 + 4 + body.len());
    buf.put_u8(FrameTag::Message.byte());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    buf
}

/// Writes a control frame.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode_message(msg)).await?;
    writer.flush().await
}

/// Writes the header of a stream frame; `len` raw bytes must follow.
pub async fn write_stream_header<W>(writer: &mut W, len: u64) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0u8; 9];
    buf[0] = FrameTag::Stream.byte();
    buf[1..].copy_from_slice(&len.to_le_bytes());
    writer.write_all(&buf).await
}

/// Reads the tag and length of the next frame.
pub async fn read_frame_header<R>(reader: &mut R) -> Result<FrameHeader, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = reader.read_u8().await?;
    match FrameTag::from_byte(tag) {
        Some(FrameTag::Message) => {
            let len = reader.read_u32_le().await?;
            if len > MAX_CONTROL_FRAME_SIZE {
                return Err(FrameError::TooLarge(len));
            }
            Ok(FrameHeader::Message(len))
        }
        Some(FrameTag::Stream) => Ok(FrameHeader::Stream(reader.read_u64_le().await?)),
        None => Err(FrameError::UnknownTag(tag)),
    }
}

/// Reads a control frame body of `len` bytes and decodes it.
///
/// The body is consumed in full even if decoding fails, so the reader
/// stays positioned at the next frame.
pub async fn read_message_body<R>(reader: &mut R, len: u32) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Message::from_bytes(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::GetFile {
            request_id: 3,
            key: "0cc175b9c0f1b6a831c399e269772661".to_string(),
        }
    }

    #[tokio::test]
    async fn test_control_frame_roundtrip() {
        let mut wire = Vec::new();
        write_message(&mut wire, &sample()).await.unwrap();
        assert_eq!(wire[0], FrameTag::Message.byte());

        let mut reader = wire.as_slice();
        let header = read_frame_header(&mut reader).await.unwrap();
        let FrameHeader::Message(len) = header else {
            panic!("expected control frame, got {:?}", header);
        };
        let msg = read_message_body(&mut reader, len).await.unwrap();
        assert_eq!(msg, sample());
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_stream_header() {
        let mut wire = Vec::new();
        write_stream_header(&mut wire, 1_000_000).await.unwrap();
        assert_eq!(wire.len(), 9);

        let mut reader = wire.as_slice();
        let header = read_frame_header(&mut reader).await.unwrap();
        assert_eq!(header, FrameHeader::Stream(1_000_000));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_fatal() {
        let mut reader: &[u8] = &[0x7f, 0, 0, 0, 0];
        let err = read_frame_header(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownTag(0x7f)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_oversized_control_frame() {
        let mut wire = vec![FrameTag::Message.byte()];
        wire.extend_from_slice(&(MAX_CONTROL_FRAME_SIZE + 1).to_le_bytes());

        let mut reader = wire.as_slice();
        let err = read_frame_header(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn test_bad_body_keeps_alignment() {
        // A control frame whose body carries an unknown message tag,
        // followed by a valid frame.
        let mut wire = vec![FrameTag::Message.byte()];
        wire.extend_from_slice(&4u32.to_le_bytes());
        wire.extend_from_slice(&99u32.to_le_bytes());
        write_message(&mut wire, &sample()).await.unwrap();

        let mut reader = wire.as_slice();
        let FrameHeader::Message(len) = read_frame_header(&mut reader).await.unwrap() else {
            panic!("expected control frame");
        };
        let err = read_message_body(&mut reader, len).await.unwrap_err();
        assert!(err.is_recoverable());

        let FrameHeader::Message(len) = read_frame_header(&mut reader).await.unwrap() else {
            panic!("expected control frame");
        };
        assert_eq!(read_message_body(&mut reader, len).await.unwrap(), sample());
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let mut reader: &[u8] = &[];
        let err = read_frame_header(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }
}
