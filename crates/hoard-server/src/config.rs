//! File server configuration.

use std::time::Duration;

use hoard_core::SecretKey;
use hoard_store::StoreConfig;

/// File server configuration.
#[derive(Debug, Clone)]
pub struct FileServerConfig {
    /// Network secret, identical on every node
    pub secret: SecretKey,
    /// Local storage
    pub store: StoreConfig,
    /// Addresses dialed on start
    pub bootstrap_nodes: Vec<String>,
    /// How long `get` waits for peers to answer
    pub response_timeout: Duration,
}

impl FileServerConfig {
    /// Default response timeout.
    pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a configuration with no bootstrap nodes.
    pub fn new(secret: SecretKey, store: StoreConfig) -> Self {
        Self {
            secret,
            store,
            bootstrap_nodes: Vec::new(),
            response_timeout: Self::DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Sets the bootstrap nodes.
    pub fn with_bootstrap_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}
