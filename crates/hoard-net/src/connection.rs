//! Connection bookkeeping.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::trace;

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection state.
///
/// Outbound connections start at `Connecting`, inbound ones at
/// `Handshaking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect in progress
    Connecting,
    /// Handshake hook running
    Handshaking,
    /// Handshake done, peer handler notified
    Established,
    /// Read loop running
    Reading,
    /// Read loop exited
    Closed,
}

impl ConnectionState {
    /// Returns true if `next` may follow this state.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Established)
                | (Established, Reading)
                | (_, Closed)
        )
    }
}

/// One TCP connection, owned by its read loop.
#[derive(Debug)]
pub struct Connection {
    /// Connection ID
    pub id: ConnectionId,
    /// Remote address
    pub remote: SocketAddr,
    /// True if we dialed
    pub outbound: bool,
    /// Current state
    pub state: ConnectionState,
    /// When the handshake completed
    pub established_at: Option<Instant>,
    /// Frames read
    pub frames_received: u64,
    /// Payload bytes read
    pub bytes_received: u64,
}

impl Connection {
    /// Creates a new connection.
    pub fn new(remote: SocketAddr, outbound: bool) -> Self {
        Self {
            id: ConnectionId::new(),
            remote,
            outbound,
            state: if outbound {
                ConnectionState::Connecting
            } else {
                ConnectionState::Handshaking
            },
            established_at: None,
            frames_received: 0,
            bytes_received: 0,
        }
    }

    /// Moves to `next`. Invalid transitions are ignored.
    pub fn set_state(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            trace!(conn = self.id.0, from = ?self.state, to = ?next, "Ignoring state transition");
            return;
        }
        trace!(conn = self.id.0, remote = %self.remote, from = ?self.state, to = ?next, "Connection state");
        if next == ConnectionState::Established {
            self.established_at = Some(Instant::now());
        }
        self.state = next;
    }

    /// Records a received frame.
    pub fn record_received(&mut self, bytes: u64) {
        self.frames_received += 1;
        self.bytes_received += bytes;
    }

    /// Returns the time since the handshake completed.
    pub fn duration(&self) -> Option<Duration> {
        self.established_at.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 3000))
    }

    #[test]
    fn test_outbound_lifecycle() {
        let mut conn = Connection::new(addr(), true);
        assert_eq!(conn.state, ConnectionState::Connecting);

        conn.set_state(ConnectionState::Handshaking);
        conn.set_state(ConnectionState::Established);
        assert!(conn.duration().is_some());
        conn.set_state(ConnectionState::Reading);
        assert_eq!(conn.state, ConnectionState::Reading);

        conn.record_received(100);
        conn.record_received(20);
        assert_eq!(conn.frames_received, 2);
        assert_eq!(conn.bytes_received, 120);

        conn.set_state(ConnectionState::Closed);
        assert_eq!(conn.state, ConnectionState::Closed);
    }

    #[test]
    fn test_inbound_starts_handshaking() {
        let mut conn = Connection::new(addr(), false);
        assert_eq!(conn.state, ConnectionState::Handshaking);

        // Skipping the handshake is not allowed.
        conn.set_state(ConnectionState::Reading);
        assert_eq!(conn.state, ConnectionState::Handshaking);

        // Any state can close.
        conn.set_state(ConnectionState::Closed);
        assert_eq!(conn.state, ConnectionState::Closed);
    }

    #[test]
    fn test_connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
