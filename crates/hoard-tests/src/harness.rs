//! Multi-node networks on loopback, each node with its own temporary store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hoard_core::SecretKey;
use tokio::time::sleep;
use tracing::info;

use crate::node::{TestNode, TestNodeConfig};
use crate::TestResult;

/// A set of nodes sharing one network secret.
pub struct TestNetwork {
    /// Secret shared by all nodes
    pub secret: SecretKey,
    nodes: Vec<Arc<TestNode>>,
}

impl TestNetwork {
    /// An empty network with a fresh secret.
    pub fn new() -> Self {
        Self {
            secret: SecretKey::random(),
            nodes: Vec::new(),
        }
    }

    /// Creates a test network with `count` unconnected nodes.
    pub async fn with_nodes(count: usize) -> TestResult<Self> {
        let mut network = Self::new();
        for _ in 0..count {
            network.add_node(Vec::new()).await?;
        }
        Ok(network)
    }

    /// Starts a node that bootstraps to `bootstrap_nodes`.
    pub async fn add_node(&mut self, bootstrap_nodes: Vec<String>) -> TestResult<Arc<TestNode>> {
        let config = TestNodeConfig {
            secret: self.secret.clone(),
            bootstrap_nodes,
            ..Default::default()
        };

        let node = Arc::new(TestNode::start(config).await?);
        self.nodes.push(Arc::clone(&node));

        info!(addr = %node.addr(), total = self.nodes.len(), "Node joined");
        Ok(node)
    }

    /// Returns the number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns all nodes.
    pub fn nodes(&self) -> &[Arc<TestNode>] {
        &self.nodes
    }

    /// Node `index`, in the order nodes were added.
    pub fn node(&self, index: usize) -> Option<&Arc<TestNode>> {
        self.nodes.get(index)
    }

    /// Connects every pair of nodes once.
    pub async fn connect_mesh(&self) -> TestResult<()> {
        for (i, dialer) in self.nodes.iter().enumerate() {
            for target in &self.nodes[i + 1..] {
                dialer.connect_to(target).await?;
            }
        }

        let peers = self.nodes.len().saturating_sub(1);
        self.wait_for_connections(peers, Duration::from_secs(5)).await?;
        info!(nodes = self.nodes.len(), "Mesh ready");
        Ok(())
    }

    /// Connects every node to the first one.
    pub async fn connect_star(&self) -> TestResult<()> {
        let Some((hub, spokes)) = self.nodes.split_first() else {
            return Ok(());
        };
        for spoke in spokes {
            spoke.connect_to(hub).await?;
        }

        hub.wait_for_peers(spokes.len(), Duration::from_secs(5)).await?;
        for spoke in spokes {
            spoke.wait_for_peers(1, Duration::from_secs(5)).await?;
        }
        info!(nodes = self.nodes.len(), "Star ready");
        Ok(())
    }

    /// Waits for every node to have at least `min_peers` peers.
    pub async fn wait_for_connections(&self, min_peers: usize, timeout: Duration) -> TestResult<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.nodes.iter().all(|n| n.peer_count() >= min_peers) {
                return Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
        Err("Timeout waiting for connections".into())
    }

    /// Returns the sum of peer counts over all nodes.
    pub fn total_connections(&self) -> usize {
        self.nodes.iter().map(|n| n.peer_count()).sum()
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}
