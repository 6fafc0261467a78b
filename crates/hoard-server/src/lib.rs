//! Hoard Server - The file server protocol.
//!
//! Ties a [`Store`](hoard_store::Store) to a [`Transport`](hoard_net::Transport):
//! - Files stored locally are replicated to every connected peer
//! - Files missing locally are fetched from whichever peer has them
//! - Requests from peers are answered from the local store

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod pending;
pub mod registry;
pub mod server;

pub use config::FileServerConfig;
pub use pending::{FetchOutcome, InboundTransfer, PendingRequests, TransferQueue};
pub use registry::PeerRegistry;
pub use server::{FileServer, STOP_TIMEOUT};

use hoard_core::CryptoError;
use hoard_net::TransportError;
use hoard_store::StoreError;
use thiserror::Error;

/// File server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Local store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Network failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Encryption failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Message from an address not in the peer table
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Neither the local store nor any peer has the key
    #[error("Cannot serve {0}: not found on the network")]
    NotFound(String),

    /// A stream did not match its announced size
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Announced size
        expected: u64,
        /// Observed size
        actual: u64,
    },

    /// The server is stopped or was already started
    #[error("Server closed")]
    Closed,
}
