//! The shared network secret.

use std::fmt;

use rand::RngCore;
use zeroize::Zeroize;

use crate::SECRET_KEY_SIZE;

/// Symmetric secret shared by every node of a network.
///
/// Encrypts file bytes in flight. Exactly one per server instance,
/// supplied at construction and never rotated. Nodes that must exchange
/// files have to be configured with the same secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; SECRET_KEY_SIZE]);

impl SecretKey {
    /// Creates a secret from raw bytes.
    pub const fn new(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generates a random secret from the OS-seeded thread RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; SECRET_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a secret from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; SECRET_KEY_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns the secret as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }

    /// Returns as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

impl From<[u8; SECRET_KEY_SIZE]> for SecretKey {
    fn from(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Zeroizes the key on drop.
impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
