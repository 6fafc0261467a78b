//! Lookup key hashing.

use md5::{Digest, Md5};

/// Hashes an application key into a 32-character lowercase hex digest.
///
/// Not collision resistant against an adversary; it only keeps literal key
/// strings off the wire.
///
/// # Example
/// ```
/// use hoard_core::hash_key;
///
/// assert_eq!(hash_key(""), "d41d8cd98f00b204e9800998ecf8427e");
/// ```
pub fn hash_key(key: &str) -> String {
    hex::encode(Md5::digest(key.as_bytes()))
}
