//! Test node implementation for integration testing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hoard_core::SecretKey;
use hoard_net::{TcpTransport, TcpTransportConfig, Transport};
use hoard_server::{FileServer, FileServerConfig};
use hoard_store::StoreConfig;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::TestResult;

/// Configuration for a test node.
#[derive(Debug, Clone)]
pub struct TestNodeConfig {
    /// Listen address
    pub listen_addr: SocketAddr,
    /// Network secret
    pub secret: SecretKey,
    /// Nodes dialed on start
    pub bootstrap_nodes: Vec<String>,
    /// How long `get` waits for peers
    pub response_timeout: Duration,
}

impl Default for TestNodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            secret: SecretKey::random(),
            bootstrap_nodes: Vec::new(),
            response_timeout: Duration::from_secs(2),
        }
    }
}

/// A started file server with its own temporary store.
pub struct TestNode {
    /// The server under test
    pub server: FileServer,
    /// Its transport, for dialing directly
    pub transport: Arc<TcpTransport>,
    /// Network secret
    pub secret: SecretKey,
    addr: SocketAddr,
    _temp_dir: TempDir,
}

impl TestNode {
    /// Creates and starts a node.
    pub async fn start(config: TestNodeConfig) -> TestResult<Self> {
        let temp_dir = TempDir::new()?;

        let transport = Arc::new(TcpTransport::new(TcpTransportConfig::new(config.listen_addr)));
        let server_config = FileServerConfig::new(
            config.secret.clone(),
            StoreConfig::new(temp_dir.path().join("store")),
        )
        .with_bootstrap_nodes(config.bootstrap_nodes)
        .with_response_timeout(config.response_timeout);

        let server = FileServer::new(server_config, transport.clone());
        let addr = server.start().await?;

        info!(addr = %addr, "Test node started");
        Ok(Self {
            server,
            transport,
            secret: config.secret,
            addr,
            _temp_dir: temp_dir,
        })
    }

    /// Returns the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the store root on disk.
    pub fn store_root(&self) -> &std::path::Path {
        self.server.local_store().root()
    }

    /// Dials another node.
    pub async fn connect_to(&self, other: &TestNode) -> TestResult<()> {
        self.transport.dial(&other.addr.to_string()).await?;
        debug!(from = %self.addr, to = %other.addr, "Connected to peer");
        Ok(())
    }

    /// Returns the number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.server.peer_count()
    }

    /// Stores `data` under `key` and replicates it.
    pub async fn store(&self, key: &str, data: &[u8]) -> TestResult<u64> {
        let mut reader = data;
        Ok(self.server.store(key, &mut reader).await?)
    }

    /// Fetches `key`, locally or from the network, and reads it fully.
    pub async fn get_bytes(&self, key: &str) -> TestResult<Vec<u8>> {
        let (size, mut file) = self.server.get(key).await?;
        let mut buf = Vec::with_capacity(size as usize);
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Returns true if `key` is held locally.
    pub async fn has_local(&self, key: &str) -> bool {
        self.server.has_local(key).await
    }

    /// Waits until `key` is held locally.
    pub async fn wait_for_file(&self, key: &str, timeout: Duration) -> TestResult<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.has_local(key).await {
                return Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
        Err(format!("Timeout waiting for {} on {}", key, self.addr).into())
    }

    /// Waits until the local copy of `key` equals `expected`.
    ///
    /// A replicated file exists on disk before all of its bytes are
    /// written, so presence alone is not enough.
    pub async fn wait_for_contents(&self, key: &str, expected: &[u8], timeout: Duration) -> TestResult<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.has_local(key).await && self.get_bytes(key).await? == expected {
                return Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
        Err(format!("Timeout waiting for contents of {} on {}", key, self.addr).into())
    }

    /// Waits until exactly `count` peers are connected.
    pub async fn wait_for_peers(&self, count: usize, timeout: Duration) -> TestResult<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.peer_count() == count {
                return Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
        Err(format!(
            "Timeout waiting for {} peers on {} (have {})",
            count,
            self.addr,
            self.peer_count()
        )
        .into())
    }

    /// Stops the server.
    pub async fn stop(&self) {
        self.server.stop().await;
    }
}
