//! Hoard Core - Primitives shared by every Hoard crate.
//!
//! This crate provides:
//! - Key hashing so application keys never travel in the clear
//! - The network-wide symmetric secret
//! - Streaming AES-256-CTR encryption and decryption
//! - Canonical encoding for wire messages

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod encoding;
pub mod keys;

pub use crypto::{copy_decrypt, copy_encrypt, hash_key, CryptoError, StreamEncryptor};
pub use encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
pub use keys::SecretKey;

/// Size of the initialization vector prepended to every encrypted stream.
pub const IV_SIZE: usize = 16;

/// Size of the shared symmetric secret (AES-256).
pub const SECRET_KEY_SIZE: usize = 32;

/// Buffer size used when copying streams through the cipher.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;
