//! Streaming AES-256-CTR.
//!
//! Encrypted stream layout: `[16-byte IV][ciphertext]`. CTR mode needs no
//! padding, so the ciphertext is exactly as long as the plaintext. The IV
//! travels in the clear; it only has to be unique per stream.

use aes::Aes256;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::CryptoError;
use crate::{COPY_BUFFER_SIZE, IV_SIZE, SECRET_KEY_SIZE};

/// AES-256 in CTR mode with a 128-bit big-endian counter.
pub type Aes256Ctr = Ctr128BE<Aes256>;

/// A keyed CTR cipher together with the IV it was initialized with.
///
/// One encryptor produces one ciphertext stream. Broadcasting the same
/// stream to several peers means feeding every block through a single
/// encryptor and writing the result to each peer, so all of them share
/// the IV.
pub struct StreamEncryptor {
    cipher: Aes256Ctr,
    iv: [u8; IV_SIZE],
}

impl StreamEncryptor {
    /// Creates an encryptor with a fresh random IV.
    pub fn new(secret: &[u8]) -> Result<Self, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        Self::with_iv(secret, iv)
    }

    /// Creates a cipher for a known IV (the decrypting side).
    pub fn with_iv(secret: &[u8], iv: [u8; IV_SIZE]) -> Result<Self, CryptoError> {
        let cipher = Aes256Ctr::new_from_slices(secret, &iv)
            .map_err(|_| CryptoError::InvalidKeyLength(secret.len()))?;
        Ok(Self { cipher, iv })
    }

    /// Returns the IV, which must be written ahead of the ciphertext.
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// XORs the keystream into `buf` in place.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

/// Encrypts `src` into `dst`.
///
/// Writes a random IV first, then the ciphertext block by block. Returns
/// the total bytes written, IV included.
pub async fn copy_encrypt<R, W>(secret: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut encryptor = StreamEncryptor::new(secret)?;
    dst.write_all(encryptor.iv()).await?;

    let written = copy_stream(&mut encryptor, src, dst).await?;
    dst.flush().await?;

    Ok(IV_SIZE as u64 + written)
}

/// Decrypts `src` into `dst`.
///
/// Reads the IV preamble, then the ciphertext until EOF. Returns the
/// plaintext bytes written. A stream shorter than the IV is an
/// `UnexpectedEof` error.
pub async fn copy_decrypt<R, W>(secret: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    // Reject a bad key before consuming anything from the source.
    if secret.len() != SECRET_KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength(secret.len()));
    }

    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).await?;
    let mut decryptor = StreamEncryptor::with_iv(secret, iv)?;

    let written = copy_stream(&mut decryptor, src, dst).await?;
    dst.flush().await?;

    Ok(written)
}

async fn copy_stream<R, W>(
    cipher: &mut StreamEncryptor,
    src: &mut R,
    dst: &mut W,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }

    Ok(written)
}
