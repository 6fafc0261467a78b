//! Transport trait and configuration.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hoard_proto::{FrameError, Message};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::handshake::{Handshake, NopHandshake};
use crate::peer::{IncomingStream, TcpPeer};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Transport or connection already closed
    #[error("Transport closed")]
    Closed,

    /// Control frame larger than allowed
    #[error("Control frame too large: {0} bytes")]
    FrameTooLarge(u32),

    /// Frame tag is neither control nor stream
    #[error("Unknown frame tag: {0:#04x}")]
    UnknownFrameTag(u8),

    /// Control frame body could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] hoard_core::DecodeError),

    /// `listen` has not been called
    #[error("Transport is not listening")]
    NotListening,
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => TransportError::Io(e),
            FrameError::UnknownTag(tag) => TransportError::UnknownFrameTag(tag),
            FrameError::TooLarge(len) => TransportError::FrameTooLarge(len),
            FrameError::Decode(e) => TransportError::Decode(e),
        }
    }
}

/// TCP transport configuration.
#[derive(Clone)]
pub struct TcpTransportConfig {
    /// Listen address; port 0 picks a free port
    pub listen_addr: SocketAddr,
    /// Connection handshake hook
    pub handshake: Arc<dyn Handshake>,
    /// Capacity of the inbound RPC channel
    pub inbound_capacity: usize,
    /// Dial timeout
    pub connect_timeout: Duration,
    /// Upper bound on the handshake
    pub handshake_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            handshake: Arc::new(NopHandshake),
            inbound_capacity: 1024,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpTransportConfig {
    /// Creates a configuration listening on `listen_addr`.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Replaces the handshake hook.
    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = handshake;
        self
    }
}

impl fmt::Debug for TcpTransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransportConfig")
            .field("listen_addr", &self.listen_addr)
            .field("inbound_capacity", &self.inbound_capacity)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// A frame received from a peer.
#[derive(Debug)]
pub enum InboundFrame {
    /// A decoded control message
    Message(Message),
    /// A raw byte stream; read it to the end or drop it
    Stream(IncomingStream),
    /// The connection is gone. Always the last frame from that peer.
    Closed,
}

/// An inbound frame tagged with the sending peer.
#[derive(Debug)]
pub struct Rpc {
    /// Remote address of the sender
    pub from: String,
    /// The frame
    pub frame: InboundFrame,
}

/// Peer lifecycle callbacks.
///
/// `on_peer_connected` runs after the handshake and before the first frame
/// is read. Returning an error closes the connection.
pub trait PeerHandler: Send + Sync {
    /// Called once per established connection.
    fn on_peer_connected(&self, peer: TcpPeer) -> Result<(), TransportError>;

    /// Called when a connection's read loop exits.
    fn on_peer_disconnected(&self, id: &str);
}

/// Abstract transport layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the bound listen address.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;

    /// Binds the listener and starts accepting. Returns the bound address.
    async fn listen(&self) -> Result<SocketAddr, TransportError>;

    /// Connects to a remote node.
    ///
    /// Returns once the handshake is done and the peer handler has seen
    /// the new peer.
    async fn dial(&self, addr: &str) -> Result<(), TransportError>;

    /// Takes the inbound RPC receiver. Only the first call gets it.
    fn consume(&self) -> Option<mpsc::Receiver<Rpc>>;

    /// Installs the peer lifecycle handler.
    fn set_peer_handler(&self, handler: Arc<dyn PeerHandler>);

    /// Stops accepting and ends every read loop.
    fn close(&self);
}
