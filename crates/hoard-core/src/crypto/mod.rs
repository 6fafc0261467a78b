//! Cryptographic helpers for Hoard.
//!
//! - MD5 key hashing, so lookup keys are obscured before they cross the network
//! - AES-256-CTR stream encryption with a random per-stream IV

mod digest;
mod stream;

pub use digest::hash_key;
pub use stream::{copy_decrypt, copy_encrypt, Aes256Ctr, StreamEncryptor};

use thiserror::Error;

/// Errors from cipher construction or stream copying.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length (must be 32 bytes)
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// IO error while copying
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
