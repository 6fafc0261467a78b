//! TCP transport.
//!
//! One accept loop per transport and one read loop per connection. Read
//! loops decode frames and push them, tagged with the sender, into a
//! single bounded channel that the owner drains via `consume`.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hoard_core::COPY_BUFFER_SIZE;
use hoard_proto::frame::{read_frame_header, read_message_body};
use hoard_proto::{FrameError, FrameHeader};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionState};
use crate::peer::{IncomingStream, TcpPeer};
use crate::transport::{
    InboundFrame, PeerHandler, Rpc, TcpTransportConfig, Transport, TransportError,
};

/// Buffer between a read loop and the consumer of an inbound stream.
const STREAM_PIPE_SIZE: usize = 64 * 1024;

/// TCP implementation of [`Transport`].
pub struct TcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TcpTransportConfig,
    local_addr: RwLock<Option<SocketAddr>>,
    handler: RwLock<Option<Arc<dyn PeerHandler>>>,
    inbound_tx: mpsc::Sender<Rpc>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    /// Creates a transport. Nothing is bound until `listen`.
    pub fn new(config: TcpTransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                local_addr: RwLock::new(None),
                handler: RwLock::new(None),
                inbound_tx: tx,
                inbound_rx: Mutex::new(Some(rx)),
                shutdown,
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.inner.config
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr.read().ok_or(TransportError::NotListening)
    }

    async fn listen(&self) -> Result<SocketAddr, TransportError> {
        if self.inner.is_closed() {
            return Err(TransportError::Closed);
        }

        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.write() = Some(addr);
        info!(addr = %addr, "TCP transport listening");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.accept_loop(listener).await });

        Ok(addr)
    }

    async fn dial(&self, addr: &str) -> Result<(), TransportError> {
        if self.inner.is_closed() {
            return Err(TransportError::Closed);
        }

        let stream = tokio::time::timeout(self.inner.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(ErrorKind::TimedOut, format!("dial {} timed out", addr)))??;
        let remote = stream.peer_addr()?;

        let mut conn = Connection::new(remote, true);
        conn.set_state(ConnectionState::Handshaking);

        let (peer, reader) = self.inner.establish(stream, &mut conn).await?;
        debug!(addr = %remote, "Dialed peer");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.read_loop(conn, peer, reader).await });
        Ok(())
    }

    fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.inner.inbound_rx.lock().take()
    }

    fn set_peer_handler(&self, handler: Arc<dyn PeerHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    fn close(&self) {
        if !self.inner.shutdown.send_replace(true) {
            info!("TCP transport closed");
        }
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let inner = Arc::clone(&self);
                        tokio::spawn(async move { inner.handle_inbound(stream, remote).await });
                    }
                    Err(e) => warn!(error = %e, "TCP accept error"),
                }
            }
        }

        debug!("Accept loop stopped");
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let mut conn = Connection::new(remote, false);
        match self.establish(stream, &mut conn).await {
            Ok((peer, reader)) => {
                debug!(addr = %remote, "Accepted peer");
                self.read_loop(conn, peer, reader).await;
            }
            Err(e) => {
                debug!(addr = %remote, error = %e, "Dropping inbound connection");
            }
        }
    }

    /// Runs the handshake and hands the new peer to the handler.
    async fn establish(
        &self,
        mut stream: TcpStream,
        conn: &mut Connection,
    ) -> Result<(TcpPeer, OwnedReadHalf), TransportError> {
        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            self.config.handshake.handshake(&mut stream, conn.outbound),
        )
        .await
        .map_err(|_| TransportError::HandshakeFailed("timed out".to_string()))?;

        if let Err(e) = handshake {
            conn.set_state(ConnectionState::Closed);
            return Err(e);
        }
        conn.set_state(ConnectionState::Established);

        let (reader, writer) = stream.into_split();
        let peer = TcpPeer::new(conn.remote, conn.outbound, writer);

        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            if let Err(e) = handler.on_peer_connected(peer.clone()) {
                conn.set_state(ConnectionState::Closed);
                return Err(e);
            }
        }

        Ok((peer, reader))
    }

    async fn read_loop(self: Arc<Self>, mut conn: Connection, peer: TcpPeer, reader: OwnedReadHalf) {
        conn.set_state(ConnectionState::Reading);
        let mut shutdown = self.shutdown.subscribe();
        let mut reader = BufReader::new(reader);

        let result = if *shutdown.borrow_and_update() {
            Ok(())
        } else {
            self.read_frames(&mut conn, &peer, &mut reader, &mut shutdown).await
        };

        match result {
            Ok(()) => debug!(
                addr = %conn.remote,
                frames = conn.frames_received,
                uptime = ?conn.duration(),
                "Connection closed"
            ),
            Err(e) => warn!(addr = %conn.remote, error = %e, "Dropping peer connection"),
        }
        conn.set_state(ConnectionState::Closed);

        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_peer_disconnected(peer.id());
        }

        // The peer may have been cloned elsewhere; make sure the remote
        // sees EOF either way.
        let _ = peer.lock().await.shutdown().await;

        if !*shutdown.borrow() {
            let closed = Rpc {
                from: peer.id().to_string(),
                frame: InboundFrame::Closed,
            };
            self.deliver(closed, &mut shutdown).await;
        }
    }

    async fn read_frames(
        &self,
        conn: &mut Connection,
        peer: &TcpPeer,
        reader: &mut BufReader<OwnedReadHalf>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        loop {
            let header = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = peer.closed() => return Ok(()),
                header = read_frame_header(reader) => header,
            };

            match header {
                Ok(FrameHeader::Message(len)) => match read_message_body(reader, len).await {
                    Ok(msg) => {
                        conn.record_received(len as u64);
                        let rpc = Rpc {
                            from: peer.id().to_string(),
                            frame: InboundFrame::Message(msg),
                        };
                        if !self.deliver(rpc, shutdown).await {
                            return Ok(());
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!(addr = %conn.remote, error = %e, "Discarding undecodable message");
                    }
                    Err(e) => return Err(e.into()),
                },
                Ok(FrameHeader::Stream(len)) => {
                    conn.record_received(len);
                    let (consumer, pipe) = tokio::io::duplex(STREAM_PIPE_SIZE);
                    let rpc = Rpc {
                        from: peer.id().to_string(),
                        frame: InboundFrame::Stream(IncomingStream::new(len, consumer)),
                    };
                    if !self.deliver(rpc, shutdown).await {
                        return Ok(());
                    }
                    // Dropping the pump closes the pipe, so the consumer
                    // sees a short stream rather than waiting forever.
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = peer.closed() => return Ok(()),
                        pumped = pump_stream(reader, len, pipe) => pumped?,
                    }
                }
                Err(FrameError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pushes an RPC to the consumer. Returns false if the transport is
    /// shutting down or nobody is listening any more.
    async fn deliver(&self, rpc: Rpc, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => false,
            sent = self.inbound_tx.send(rpc) => sent.is_ok(),
        }
    }
}

/// Copies `len` bytes from the socket into the stream pipe.
///
/// If the consumer goes away the rest of the frame is read and discarded,
/// so the next frame header stays aligned.
async fn pump_stream<R>(reader: &mut R, len: u64, mut pipe: DuplexStream) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE.min(len as usize).max(1)];
    let mut remaining = len;
    let mut open = true;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into());
        }
        remaining -= n as u64;

        if open && pipe.write_all(&buf[..n]).await.is_err() {
            debug!(remaining, "Stream consumer gone, draining");
            open = false;
        }
    }

    if open {
        let _ = pipe.shutdown().await;
    }
    Ok(())
}
