//! Peer table.

use std::collections::HashMap;

use hoard_net::{PeerHandler, TcpPeer, TransportError};
use parking_lot::Mutex;
use tracing::info;

/// Live peers keyed by remote address.
///
/// The lock is held only for map access, never across a write to a peer.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, TcpPeer>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the peer with the given identity.
    pub fn get(&self, id: &str) -> Option<TcpPeer> {
        self.peers.lock().get(id).cloned()
    }

    /// Returns true if `id` is connected.
    pub fn contains(&self, id: &str) -> bool {
        self.peers.lock().contains_key(id)
    }

    /// Returns the number of connected peers.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Returns true if no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Returns every peer, ordered by address.
    ///
    /// Broadcasts lock writers in this order.
    pub fn snapshot(&self) -> Vec<TcpPeer> {
        let mut peers: Vec<TcpPeer> = self.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.id().cmp(b.id()));
        peers
    }
}

impl PeerHandler for PeerRegistry {
    fn on_peer_connected(&self, peer: TcpPeer) -> Result<(), TransportError> {
        info!(addr = %peer.id(), outbound = peer.is_outbound(), "Connected with remote");
        self.peers.lock().insert(peer.id().to_string(), peer);
        Ok(())
    }

    fn on_peer_disconnected(&self, id: &str) {
        if self.peers.lock().remove(id).is_some() {
            info!(addr = %id, "Peer disconnected");
        }
    }
}
