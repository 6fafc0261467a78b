//! Content-addressable file store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use crate::config::StoreConfig;
use crate::path::PathKey;
use crate::StoreError;

/// Local file store addressed by key.
///
/// Writers to the same key are not coordinated; the last one wins.
#[derive(Debug, Clone)]
pub struct Store {
    config: StoreConfig,
}

impl Store {
    /// Creates a store. Nothing is touched on disk until the first write.
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Returns where `key` lives, relative to the root.
    pub fn path_key(&self, key: &str) -> PathKey {
        (self.config.path_transform)(key)
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.path_key(key).file_under(&self.config.root)
    }

    /// Returns true if a file exists for `key`.
    pub async fn has(&self, key: &str) -> bool {
        fs::try_exists(self.file_path(key)).await.unwrap_or(false)
    }

    /// Copies `reader` to disk under `key`, replacing any previous content.
    ///
    /// The bytes go to a temporary file next to the target, which is renamed
    /// over it once complete. Readers see either the old file or the new one.
    /// Returns the number of bytes written.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut staged = self.stage(key).await?;
        let n = match tokio::io::copy(reader, &mut staged.file).await {
            Ok(n) => n,
            Err(e) => {
                staged.discard().await;
                return Err(e.into());
            }
        };
        let path = staged.commit().await?;

        debug!(bytes = n, path = %path.display(), "Written to disk");
        Ok(n)
    }

    /// Decrypts `reader` with `secret` and writes the plaintext under `key`.
    ///
    /// Returns the number of plaintext bytes written. A failed decrypt
    /// leaves any previous content in place.
    pub async fn write_decrypted<R>(
        &self,
        secret: &[u8],
        key: &str,
        reader: &mut R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.decrypt_into(secret, key, reader, None).await
    }

    /// Like [`Store::write_decrypted`], but only replaces the stored file if
    /// exactly `plaintext_len` bytes were decrypted.
    pub async fn write_decrypted_exact<R>(
        &self,
        secret: &[u8],
        key: &str,
        reader: &mut R,
        plaintext_len: u64,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.decrypt_into(secret, key, reader, Some(plaintext_len)).await
    }

    async fn decrypt_into<R>(
        &self,
        secret: &[u8],
        key: &str,
        reader: &mut R,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut staged = self.stage(key).await?;
        let n = match hoard_core::copy_decrypt(secret, reader, &mut staged.file).await {
            Ok(n) => n,
            Err(e) => {
                staged.discard().await;
                return Err(e.into());
            }
        };
        if let Some(expected) = expected.filter(|&len| len != n) {
            staged.discard().await;
            return Err(StoreError::SizeMismatch { expected, actual: n });
        }
        let path = staged.commit().await?;

        debug!(bytes = n, path = %path.display(), "Written decrypted to disk");
        Ok(n)
    }

    async fn stage(&self, key: &str) -> Result<Staged, StoreError> {
        let path_key = self.path_key(key);
        let dir = path_key.dir_under(&self.config.root);
        fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".{}.{:016x}.tmp", path_key.filename, rand::random::<u64>()));
        let file = File::create(&tmp).await?;
        Ok(Staged {
            tmp,
            dest: path_key.file_under(&self.config.root),
            file,
        })
    }

    /// Opens `key` for streaming.
    ///
    /// Returns the file size and the open handle; dropping the handle
    /// closes the file.
    pub async fn read(&self, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.file_path(key);
        let file = File::open(&path).await.map_err(|e| not_found(e, key))?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Removes `key`.
    ///
    /// Deletes the leaf file, then prunes parent directories bottom-up while
    /// they are empty, so other keys sharing a prefix survive.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path_key = self.path_key(key);
        let path = path_key.file_under(&self.config.root);
        fs::remove_file(&path).await.map_err(|e| not_found(e, key))?;

        let root = self.config.root.as_path();
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == root || !current.starts_with(root) {
                break;
            }
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }

        debug!(filename = %path_key.filename, "Deleted from disk");
        Ok(())
    }

    /// Removes the whole root directory.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.config.root).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// A write in progress, kept under a temporary name until committed.
struct Staged {
    tmp: PathBuf,
    dest: PathBuf,
    file: File,
}

impl Staged {
    /// Flushes the temporary file and renames it over the destination.
    async fn commit(self) -> Result<PathBuf, StoreError> {
        let Staged { tmp, dest, mut file } = self;
        let flushed = file.flush().await;
        drop(file);

        if let Err(e) = flushed {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(dest)
    }

    async fn discard(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.tmp).await {
            debug!(path = %self.tmp.display(), error = %e, "Cannot remove temporary file");
        }
    }
}

fn not_found(err: std::io::Error, key: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::path::{identity_path_transform, PathKey};
    use hoard_core::{copy_encrypt, SecretKey};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn new_store(dir: &TempDir) -> Store {
        Store::new(StoreConfig::new(dir.path().join("root")))
    }

    async fn read_all(store: &Store, key: &str) -> Vec<u8> {
        let (size, mut file) = store.read(key).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(size as usize, buf.len());
        buf
    }

    #[tokio::test]
    async fn test_store_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        for i in 0..50 {
            let key = format!("foo_{}", i);
            let data = b"some jpg bytes";

            assert!(!store.has(&key).await);

            let n = store.write(&key, &mut data.as_slice()).await.unwrap();
            assert_eq!(n, data.len() as u64);
            assert!(store.has(&key).await);
            assert_eq!(read_all(&store, &key).await, data);

            store.delete(&key).await.unwrap();
            assert!(!store.has(&key).await);
        }
    }

    #[tokio::test]
    async fn test_empty_and_large_payloads() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        store.write("empty", &mut &b""[..]).await.unwrap();
        assert!(store.has("empty").await);
        assert!(read_all(&store, "empty").await.is_empty());

        let large: Vec<u8> = (0..200_000).map(|i| (i % 256) as u8).collect();
        store.write("large", &mut large.as_slice()).await.unwrap();
        assert_eq!(read_all(&store, "large").await, large);
    }

    #[tokio::test]
    async fn test_overwrite_truncates() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        store.write("k", &mut &b"a much longer first version"[..]).await.unwrap();
        store.write("k", &mut &b"short"[..]).await.unwrap();
        assert_eq!(read_all(&store, "k").await, b"short");
    }

    #[tokio::test]
    async fn test_layout_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        store.write("momsbestpicture", &mut &b"pic"[..]).await.unwrap();
        let expected = dir
            .path()
            .join("root/68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff")
            .join("6804429f74181a63c50c3d81d733a12f14a353ff");
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn test_read_missing() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        assert!(matches!(store.read("nope").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("nope").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        store.write("momsbestpicture", &mut &b"pic"[..]).await.unwrap();
        store.delete("momsbestpicture").await.unwrap();

        assert!(!dir.path().join("root/68044").exists());
        assert!(store.root().exists());
    }

    #[tokio::test]
    async fn test_delete_keeps_siblings() {
        let dir = TempDir::new().unwrap();
        // Two keys sharing their first segment.
        let transform = Arc::new(|key: &str| PathKey {
            pathname: format!("shared/{}", key),
            filename: key.to_string(),
        });
        let store = Store::new(StoreConfig::new(dir.path()).with_path_transform(transform));

        store.write("one", &mut &b"1"[..]).await.unwrap();
        store.write("two", &mut &b"2"[..]).await.unwrap();
        store.delete("one").await.unwrap();

        assert!(!store.has("one").await);
        assert!(store.has("two").await);
        assert_eq!(read_all(&store, "two").await, b"2");
    }

    #[tokio::test]
    async fn test_identity_transform() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(
            StoreConfig::new(dir.path()).with_path_transform(Arc::new(identity_path_transform)),
        );

        store.write("plain", &mut &b"x"[..]).await.unwrap();
        assert!(dir.path().join("plain/plain").is_file());
    }

    #[tokio::test]
    async fn test_write_decrypted() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let secret = SecretKey::random();
        let plaintext = b"encrypted in flight, plain at rest";

        let mut ciphertext = Vec::new();
        copy_encrypt(secret.as_slice(), &mut &plaintext[..], &mut ciphertext)
            .await
            .unwrap();

        let n = store
            .write_decrypted(secret.as_slice(), "k", &mut ciphertext.as_slice())
            .await
            .unwrap();
        assert_eq!(n, plaintext.len() as u64);
        assert_eq!(read_all(&store, "k").await, plaintext);
    }

    #[tokio::test]
    async fn test_open_reader_survives_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let old: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();

        store.write("k", &mut old.as_slice()).await.unwrap();
        let (size, mut file) = store.read("k").await.unwrap();

        store.write("k", &mut &b"new"[..]).await.unwrap();

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(size, old.len() as u64);
        assert_eq!(buf, old);
        assert_eq!(read_all(&store, "k").await, b"new");
    }

    #[tokio::test]
    async fn test_failed_decrypt_keeps_previous_content() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let secret = SecretKey::random();

        store.write("k", &mut &b"old"[..]).await.unwrap();

        // Shorter than the IV.
        let result = store
            .write_decrypted(secret.as_slice(), "k", &mut &[0u8; 5][..])
            .await;
        assert!(matches!(result, Err(StoreError::Crypto(_))));
        assert_eq!(read_all(&store, "k").await, b"old");

        // No temporary file is left next to the target.
        let parent = store.path_key("k").dir_under(store.root());
        let entries = std::fs::read_dir(parent).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_write_decrypted_exact_rejects_short_stream() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let secret = SecretKey::random();

        let mut ciphertext = Vec::new();
        copy_encrypt(secret.as_slice(), &mut &[7u8; 100][..], &mut ciphertext)
            .await
            .unwrap();

        let result = store
            .write_decrypted_exact(secret.as_slice(), "k", &mut ciphertext.as_slice(), 200)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::SizeMismatch {
                expected: 200,
                actual: 100
            })
        ));
        assert!(!store.has("k").await);

        let n = store
            .write_decrypted_exact(secret.as_slice(), "k", &mut ciphertext.as_slice(), 100)
            .await
            .unwrap();
        assert_eq!(n, 100);
        assert_eq!(read_all(&store, "k").await, [7u8; 100]);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        store.write("a", &mut &b"1"[..]).await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.root().exists());

        // Clearing an absent root is fine.
        store.clear().await.unwrap();
    }
}
