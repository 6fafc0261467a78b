//! Hoard Network - Peer transport.
//!
//! Plain TCP with a pluggable handshake:
//! - One accept loop per listener, one read loop per connection
//! - Control messages and raw byte streams multiplexed on one socket
//! - Peer lifecycle callbacks for whoever keeps the peer table

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod connection;
pub mod handshake;
pub mod peer;
pub mod tcp;
pub mod transport;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use handshake::{Handshake, NopHandshake, PreambleHandshake, PROTOCOL_PREAMBLE};
pub use peer::{IncomingStream, PeerWriter, TcpPeer};
pub use tcp::TcpTransport;
pub use transport::{
    InboundFrame, PeerHandler, Rpc, TcpTransportConfig, Transport, TransportError,
};
