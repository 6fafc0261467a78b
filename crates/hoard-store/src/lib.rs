//! Hoard Store - Content-addressable local storage.
//!
//! Maps an opaque key to a multi-level directory path derived from a hash
//! of the key, and streams file bytes in and out of it:
//! - Plain writes for locally submitted files
//! - Decrypting writes for files received from peers
//! - Streaming reads with the file size

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod path;
pub mod store;

pub use config::{StoreConfig, DEFAULT_ROOT_FOLDER_NAME};
pub use path::{cas_path_transform, identity_path_transform, PathKey, PathTransform};
pub use store::Store;

use thiserror::Error;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key not present on disk
    #[error("Key not found: {0}")]
    NotFound(String),

    /// A decrypted stream had an unexpected length
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Expected plaintext length
        expected: u64,
        /// Plaintext bytes actually received
        actual: u64,
    },

    /// Decryption of an incoming stream failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] hoard_core::CryptoError),
}
