//! The file server.
//!
//! Application keys are hashed with [`hash_key`] before they reach the
//! store or the wire, on every node, so a file written by one node lands
//! under the same path everywhere it is replicated. Files are plaintext at
//! rest and AES-CTR encrypted with the network secret in flight.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use hoard_core::{copy_encrypt, hash_key, SecretKey, StreamEncryptor, COPY_BUFFER_SIZE, IV_SIZE};
use hoard_net::{InboundFrame, IncomingStream, PeerWriter, Rpc, TcpPeer, Transport};
use hoard_proto::{Message, RequestId};
use hoard_store::{Store, StoreError};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FileServerConfig;
use crate::pending::{FetchOutcome, InboundTransfer, PendingRequests, TransferQueue};
use crate::registry::PeerRegistry;
use crate::ServerError;

/// Upper bound on how long [`FileServer::stop`] waits for the dispatch loop.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A storage node.
pub struct FileServer {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    secret: SecretKey,
    store: Store,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerRegistry>,
    pending: PendingRequests,
    bootstrap_nodes: Vec<String>,
    response_timeout: Duration,
}

impl FileServer {
    /// Creates a server on top of `transport` and installs its peer table
    /// as the transport's peer handler.
    pub fn new(config: FileServerConfig, transport: Arc<dyn Transport>) -> Self {
        let peers = Arc::new(PeerRegistry::new());
        transport.set_peer_handler(peers.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                secret: config.secret,
                store: Store::new(config.store),
                transport,
                peers,
                pending: PendingRequests::new(),
                bootstrap_nodes: config.bootstrap_nodes,
                response_timeout: config.response_timeout,
            }),
            shutdown,
            dispatch: Mutex::new(None),
        }
    }

    /// Starts listening, dials the bootstrap nodes and spawns the dispatch
    /// loop. Returns the bound address.
    ///
    /// Fails with [`ServerError::Closed`] if the server was stopped or
    /// already started.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        if *self.shutdown.borrow() {
            return Err(ServerError::Closed);
        }
        let inbound = self.shared.transport.consume().ok_or(ServerError::Closed)?;
        let addr = self.shared.transport.listen().await?;

        self.bootstrap();

        let dispatcher = Dispatcher {
            shared: Arc::clone(&self.shared),
            transfers: TransferQueue::new(),
        };
        let handle = tokio::spawn(dispatcher.run(inbound, self.shutdown.subscribe()));
        *self.dispatch.lock() = Some(handle);

        info!(addr = %addr, "File server started");
        Ok(addr)
    }

    /// Stops the dispatch loop and closes the transport.
    ///
    /// Closing the transport cuts off any stream still being received. If
    /// the dispatch loop has not finished after [`STOP_TIMEOUT`] it is
    /// aborted.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.shared.transport.close();

        let handle = self.dispatch.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("Dispatch loop did not stop in time, aborting it");
                handle.abort();
            }
        }
    }

    /// Dials every configured bootstrap node in the background.
    ///
    /// Failures are logged and not retried. The handles resolve when each
    /// dial has finished.
    pub fn bootstrap(&self) -> Vec<JoinHandle<()>> {
        self.shared
            .bootstrap_nodes
            .iter()
            .filter(|addr| !addr.trim().is_empty())
            .map(|addr| {
                let transport = Arc::clone(&self.shared.transport);
                let addr = dial_addr(addr);
                tokio::spawn(async move {
                    debug!(addr = %addr, "Attempting to connect with remote");
                    if let Err(e) = transport.dial(&addr).await {
                        warn!(addr = %addr, error = %e, "Bootstrap dial failed");
                    }
                })
            })
            .collect()
    }

    /// Stores a file locally and replicates it to every connected peer.
    ///
    /// Returns the number of bytes stored locally. A failed write to any
    /// peer fails the whole call; the local copy stays.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let network_key = hash_key(key);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        let size = self.shared.store.write(&network_key, &mut buf.as_slice()).await?;

        let peers = self.shared.peers.snapshot();
        if peers.is_empty() {
            debug!(key = %key, bytes = size, "Stored file, no peers to replicate to");
            return Ok(size);
        }

        self.shared.broadcast_file(&peers, &network_key, buf).await?;
        info!(key = %key, bytes = size, peers = peers.len(), "Stored and replicated file");
        Ok(size)
    }

    /// Returns a file, fetching it from the network if it is not held
    /// locally.
    ///
    /// Asks every peer and waits until one has delivered the file, every
    /// peer has answered, or the response timeout elapses.
    pub async fn get(&self, key: &str) -> Result<(u64, File), ServerError> {
        let network_key = hash_key(key);

        if self.shared.store.has(&network_key).await {
            debug!(key = %key, "Serving file from local disk");
            return Ok(self.shared.store.read(&network_key).await?);
        }

        let peers = self.shared.peers.snapshot();
        if peers.is_empty() {
            return Err(ServerError::NotFound(key.to_string()));
        }
        info!(key = %key, peers = peers.len(), "Don't have file locally, fetching from network");

        let (request_id, mut outcomes) = self.shared.pending.register(network_key.clone());
        let msg = Message::GetFile {
            request_id,
            key: network_key.clone(),
        };

        let mut asked = 0usize;
        for peer in &peers {
            match peer.send(&msg).await {
                Ok(()) => asked += 1,
                Err(e) => warn!(addr = %peer.id(), error = %e, "Failed to send GetFile"),
            }
        }

        let served = tokio::time::timeout(self.shared.response_timeout, async {
            let mut answered = 0usize;
            while answered < asked {
                match outcomes.recv().await {
                    Some(FetchOutcome::Stored { from, bytes }) => {
                        debug!(addr = %from, bytes, "Fetched file");
                        return true;
                    }
                    Some(FetchOutcome::Missing { from }) => {
                        debug!(addr = %from, "Peer cannot serve file");
                        answered += 1;
                    }
                    None => break,
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        self.shared.pending.remove(request_id);

        if !served {
            return Err(ServerError::NotFound(key.to_string()));
        }
        Ok(self.shared.store.read(&network_key).await?)
    }

    /// Returns true if the file is held locally.
    pub async fn has_local(&self, key: &str) -> bool {
        self.shared.store.has(&hash_key(key)).await
    }

    /// Removes the local copy only; peers keep theirs.
    pub async fn delete_local(&self, key: &str) -> Result<(), ServerError> {
        self.shared.store.delete(&hash_key(key)).await?;
        Ok(())
    }

    /// Returns the number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    /// Returns the connected peers' addresses.
    pub fn peers(&self) -> Vec<String> {
        self.shared
            .peers
            .snapshot()
            .iter()
            .map(|peer| peer.id().to_string())
            .collect()
    }

    /// Returns the bound listen address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.shared.transport.local_addr()?)
    }

    /// Returns the local store.
    pub fn local_store(&self) -> &Store {
        &self.shared.store
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl Shared {
    /// Sends `StoreFile` plus one encrypted stream to every peer.
    ///
    /// All writers are locked, in address order, for the whole broadcast;
    /// every peer sees the same IV and ciphertext.
    async fn broadcast_file(&self, peers: &[TcpPeer], key: &str, mut buf: Vec<u8>) -> Result<(), ServerError> {
        let mut encryptor = StreamEncryptor::new(self.secret.as_slice())?;
        let stream_len = buf.len() as u64 + IV_SIZE as u64;
        let msg = Message::StoreFile {
            key: key.to_string(),
            size: stream_len,
        };

        let mut writers = Vec::with_capacity(peers.len());
        for peer in peers {
            writers.push(peer.lock().await);
        }

        let result = async {
            let msg = &msg;
            let iv = *encryptor.iv();
            try_join_all(writers.iter_mut().map(|w| async move {
                w.send(msg).await?;
                w.begin_stream(stream_len).await?;
                w.write_all(&iv).await?;
                Ok::<_, ServerError>(())
            }))
            .await?;

            for chunk in buf.chunks_mut(COPY_BUFFER_SIZE) {
                encryptor.apply(chunk);
                let chunk: &[u8] = chunk;
                try_join_all(writers.iter_mut().map(|w| async move { w.write_all(chunk).await })).await?;
            }

            try_join_all(writers.iter_mut().map(|w| async move { w.flush().await })).await?;
            Ok::<_, ServerError>(())
        }
        .await;

        if let Err(e) = result {
            // A half-written stream frame leaves the receivers unable to
            // find the next frame.
            abort_writers(&mut writers).await;
            return Err(e);
        }
        Ok(())
    }

    /// Answers a `GetFile` from `peer`.
    async fn serve_file(&self, peer: &TcpPeer, request_id: RequestId, key: &str) -> Result<(), ServerError> {
        let (size, file) = match self.store.read(key).await {
            Ok(found) => found,
            Err(e) => {
                peer.send(&Message::NotFound {
                    request_id,
                    key: key.to_string(),
                })
                .await?;
                return Err(match e {
                    StoreError::NotFound(_) => ServerError::NotFound(key.to_string()),
                    e => e.into(),
                });
            }
        };

        let stream_len = size + IV_SIZE as u64;
        let mut file = file.take(size);
        let mut writer = peer.lock().await;
        writer
            .send(&Message::ServeFile {
                request_id,
                key: key.to_string(),
                size: stream_len,
            })
            .await?;
        writer.begin_stream(stream_len).await?;
        let written = copy_encrypt(self.secret.as_slice(), &mut file, &mut *writer).await;
        drop(writer);

        match written {
            Ok(written) if written == stream_len => {
                info!(addr = %peer.id(), key = %key, bytes = size, "Served file over the network");
                Ok(())
            }
            Ok(written) => {
                // The file shrank while being sent.
                peer.close().await?;
                Err(ServerError::SizeMismatch {
                    expected: stream_len,
                    actual: written,
                })
            }
            Err(e) => {
                let _ = peer.close().await;
                Err(e.into())
            }
        }
    }

    /// Decrypts an announced stream into the local store.
    ///
    /// The stored file is only replaced once the whole announced stream
    /// has been decrypted.
    async fn receive_file(&self, transfer: &InboundTransfer, stream: &mut IncomingStream) -> Result<u64, ServerError> {
        let plaintext_len = transfer.size.saturating_sub(IV_SIZE as u64);
        let n = self
            .store
            .write_decrypted_exact(self.secret.as_slice(), &transfer.key, stream, plaintext_len)
            .await?;
        Ok(n)
    }
}

async fn abort_writers(writers: &mut [PeerWriter]) {
    for w in writers.iter_mut() {
        if let Err(e) = w.shutdown().await {
            debug!(addr = %w.id(), error = %e, "Shutdown after failed broadcast");
        }
    }
}

/// Consumes the transport's inbound channel.
struct Dispatcher {
    shared: Arc<Shared>,
    transfers: TransferQueue,
}

impl Dispatcher {
    async fn run(mut self, mut inbound: mpsc::Receiver<Rpc>, mut shutdown: watch::Receiver<bool>) {
        if !*shutdown.borrow_and_update() {
            loop {
                let rpc = tokio::select! {
                    _ = shutdown.changed() => break,
                    rpc = inbound.recv() => match rpc {
                        Some(rpc) => rpc,
                        None => break,
                    },
                };

                let from = rpc.from.clone();
                if let Err(e) = self.handle_rpc(rpc).await {
                    warn!(addr = %from, error = %e, "Failed to handle frame");
                }
            }
        }

        self.shared.transport.close();
        info!("File server stopped");
    }

    async fn handle_rpc(&mut self, rpc: Rpc) -> Result<(), ServerError> {
        let Rpc { from, frame } = rpc;
        match frame {
            InboundFrame::Message(msg) => self.handle_message(&from, msg),
            InboundFrame::Stream(stream) => self.handle_stream(&from, stream).await,
            InboundFrame::Closed => {
                let dropped = self.transfers.forget(&from);
                if dropped > 0 {
                    debug!(addr = %from, dropped, "Peer left with announced transfers pending");
                }
                Ok(())
            }
        }
    }

    fn handle_message(&mut self, from: &str, msg: Message) -> Result<(), ServerError> {
        debug!(addr = %from, kind = ?msg.message_type(), key = %msg.key(), "Received message");

        match msg {
            Message::StoreFile { key, size } => self.expect_transfer(
                from,
                InboundTransfer {
                    key,
                    size,
                    request_id: None,
                },
            ),
            Message::ServeFile { request_id, key, size } => self.expect_transfer(
                from,
                InboundTransfer {
                    key,
                    size,
                    request_id: Some(request_id),
                },
            ),
            Message::GetFile { request_id, key } => {
                let peer = self
                    .shared
                    .peers
                    .get(from)
                    .ok_or_else(|| ServerError::UnknownPeer(from.to_string()))?;

                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    if let Err(e) = shared.serve_file(&peer, request_id, &key).await {
                        warn!(addr = %peer.id(), key = %key, error = %e, "Cannot serve file");
                    }
                });
                Ok(())
            }
            Message::NotFound { request_id, key } => {
                let outcome = FetchOutcome::Missing {
                    from: from.to_string(),
                };
                if !self.shared.pending.notify(request_id, &key, outcome) {
                    debug!(addr = %from, request_id, "Late NotFound");
                }
                Ok(())
            }
        }
    }

    fn expect_transfer(&mut self, from: &str, transfer: InboundTransfer) -> Result<(), ServerError> {
        if !self.shared.peers.contains(from) {
            return Err(ServerError::UnknownPeer(from.to_string()));
        }
        self.transfers.push(from, transfer);
        Ok(())
    }

    async fn handle_stream(&mut self, from: &str, mut stream: IncomingStream) -> Result<(), ServerError> {
        let Some(transfer) = self.transfers.pop(from) else {
            warn!(addr = %from, bytes = stream.len(), "Discarding unannounced stream");
            return Ok(());
        };

        if stream.len() != transfer.size {
            let dropped = self.transfers.forget(from);
            debug!(addr = %from, dropped, "Announcements out of step, forgetting them");
            return Err(ServerError::SizeMismatch {
                expected: transfer.size,
                actual: stream.len(),
            });
        }

        if let Some(request_id) = transfer.request_id {
            if !self.shared.pending.is_waiting(request_id, &transfer.key) {
                debug!(addr = %from, request_id, "Discarding late response");
                return Ok(());
            }
        }

        let result = self.shared.receive_file(&transfer, &mut stream).await;
        drop(stream);

        if let Ok(bytes) = &result {
            info!(addr = %from, key = %transfer.key, bytes = *bytes, "Written file from peer");
        }

        if let Some(request_id) = transfer.request_id {
            let from = from.to_string();
            match &result {
                // First copy wins; any other server's stream for this
                // request is drained as a late response.
                Ok(bytes) => {
                    let outcome = FetchOutcome::Stored { from, bytes: *bytes };
                    self.shared.pending.complete(request_id, &transfer.key, outcome);
                }
                Err(_) => {
                    self.shared
                        .pending
                        .notify(request_id, &transfer.key, FetchOutcome::Missing { from });
                }
            }
        }

        result.map(|_| ())
    }
}

/// Turns a bare `:port` into a loopback address.
fn dial_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("127.0.0.1{}", addr)
    } else {
        addr.to_string()
    }
}
