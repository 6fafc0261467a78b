//! Connection handshake hook.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::transport::TransportError;

/// Runs on every new connection before any frame is exchanged.
///
/// `outbound` is true on the dialing side. An error closes the connection
/// without notifying the peer handler.
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Performs the handshake on the raw stream.
    async fn handshake(&self, stream: &mut TcpStream, outbound: bool) -> Result<(), TransportError>;
}

/// Accepts every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(&self, _stream: &mut TcpStream, _outbound: bool) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Preamble both sides send by default.
pub const PROTOCOL_PREAMBLE: [u8; 8] = *b"HOARD\x00\x00\x01";

/// Exchanges a fixed preamble and rejects peers that send a different one.
///
/// Catches a node dialing something that is not a hoard node, or one
/// speaking another protocol version. It does not authenticate anything.
#[derive(Debug, Clone, Copy)]
pub struct PreambleHandshake {
    preamble: [u8; 8],
}

impl PreambleHandshake {
    /// Creates a handshake with a custom preamble.
    pub fn new(preamble: [u8; 8]) -> Self {
        Self { preamble }
    }
}

impl Default for PreambleHandshake {
    fn default() -> Self {
        Self::new(PROTOCOL_PREAMBLE)
    }
}

#[async_trait]
impl Handshake for PreambleHandshake {
    async fn handshake(&self, stream: &mut TcpStream, _outbound: bool) -> Result<(), TransportError> {
        // Both sides write first; eight bytes always fit the socket buffer.
        stream.write_all(&self.preamble).await?;
        stream.flush().await?;

        let mut remote = [0u8; 8];
        stream.read_exact(&mut remote).await?;
        if remote != self.preamble {
            return Err(TransportError::HandshakeFailed(format!(
                "unexpected preamble {}",
                remote.escape_ascii()
            )));
        }
        Ok(())
    }
}
