//! Peers and inbound streams.

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hoard_proto::frame::{write_message, write_stream_header};
use hoard_proto::Message;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

use crate::transport::TransportError;

/// A live connection to a remote node.
///
/// Cheap to clone; all clones share the writer. The writer lock keeps a
/// control frame and the stream frame that follows it together.
#[derive(Debug, Clone)]
pub struct TcpPeer {
    id: String,
    remote_addr: SocketAddr,
    outbound: bool,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    close_signal: Arc<Notify>,
}

impl TcpPeer {
    pub(crate) fn new(remote_addr: SocketAddr, outbound: bool, writer: OwnedWriteHalf) -> Self {
        Self {
            id: remote_addr.to_string(),
            remote_addr,
            outbound,
            writer: Arc::new(Mutex::new(writer)),
            close_signal: Arc::new(Notify::new()),
        }
    }

    /// Returns the peer identity: the remote address as a string.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns true if we dialed this peer.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Sends one control message.
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        self.lock().await.send(msg).await
    }

    /// Locks the writer for a sequence of frames.
    pub async fn lock(&self) -> PeerWriter {
        PeerWriter {
            id: self.id.clone(),
            guard: Arc::clone(&self.writer).lock_owned().await,
        }
    }

    /// Shuts down the write side and stops the read loop.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.close_signal.notify_one();
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    pub(crate) async fn closed(&self) {
        self.close_signal.notified().await
    }
}

/// Exclusive access to a peer's write half.
///
/// Derefs to the socket, so it can be handed to anything that takes an
/// `AsyncWrite`.
pub struct PeerWriter {
    id: String,
    guard: OwnedMutexGuard<OwnedWriteHalf>,
}

impl PeerWriter {
    /// Returns the peer identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Writes a control frame.
    pub async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        write_message(&mut *self.guard, msg).await?;
        Ok(())
    }

    /// Writes a stream frame header. Exactly `len` bytes must follow.
    pub async fn begin_stream(&mut self, len: u64) -> Result<(), TransportError> {
        write_stream_header(&mut *self.guard, len).await?;
        Ok(())
    }
}

impl Deref for PeerWriter {
    type Target = OwnedWriteHalf;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for PeerWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Raw bytes of one inbound stream frame.
///
/// Yields exactly `len` bytes and then EOF, unless the connection fails
/// first. Dropping it early tells the read loop to discard the rest.
#[derive(Debug)]
pub struct IncomingStream {
    len: u64,
    inner: DuplexStream,
}

impl IncomingStream {
    pub(crate) fn new(len: u64, inner: DuplexStream) -> Self {
        Self { len, inner }
    }

    /// Returns the announced length.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true for a zero-length stream.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsyncRead for IncomingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
