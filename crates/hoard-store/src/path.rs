//! Key to path transforms.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};

/// Width of one directory segment, in hex characters.
pub const SEGMENT_WIDTH: usize = 5;

/// Where a key lives on disk, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    /// Slash-joined directory segments
    pub pathname: String,
    /// File name inside the last segment
    pub filename: String,
}

impl PathKey {
    /// Returns `pathname/filename`.
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.pathname, self.filename)
    }

    /// Returns the first path component.
    pub fn first_segment(&self) -> &str {
        self.pathname.split('/').next().unwrap_or_default()
    }

    /// Resolves the directory that holds the file under `root`.
    pub fn dir_under(&self, root: &Path) -> PathBuf {
        self.pathname
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(root.to_path_buf(), |dir, segment| dir.join(segment))
    }

    /// Resolves the file under `root`.
    pub fn file_under(&self, root: &Path) -> PathBuf {
        self.dir_under(root).join(&self.filename)
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path())
    }
}

/// A pure function from key to on-disk location.
pub type PathTransform = Arc<dyn Fn(&str) -> PathKey + Send + Sync>;

/// Content-addressed layout.
///
/// SHA-1 of the key in lowercase hex (40 chars), split into 5-character
/// segments. The filename is the full digest. Existing stores depend on
/// both the digest and the segment width.
pub fn cas_path_transform(key: &str) -> PathKey {
    let hash = hex::encode(Sha1::digest(key.as_bytes()));

    let segments: Vec<&str> = (0..hash.len() / SEGMENT_WIDTH)
        .map(|i| &hash[i * SEGMENT_WIDTH..(i + 1) * SEGMENT_WIDTH])
        .collect();

    PathKey {
        pathname: segments.join("/"),
        filename: hash,
    }
}

/// Stores each key verbatim at `key/key`.
pub fn identity_path_transform(key: &str) -> PathKey {
    PathKey {
        pathname: key.to_string(),
        filename: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_known_vector() {
        let path_key = cas_path_transform("momsbestpicture");
        assert_eq!(path_key.filename, "6804429f74181a63c50c3d81d733a12f14a353ff");
        assert_eq!(
            path_key.pathname,
            "68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff"
        );
        assert_eq!(path_key.first_segment(), "68044");
        assert_eq!(
            path_key.full_path(),
            "68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff/6804429f74181a63c50c3d81d733a12f14a353ff"
        );
    }

    #[test]
    fn test_cas_deterministic() {
        for key in ["", "a", "picture_7.png", "some/nested/key"] {
            assert_eq!(cas_path_transform(key), cas_path_transform(key));
            let path_key = cas_path_transform(key);
            assert_eq!(path_key.filename.len(), 40);
            assert_eq!(path_key.pathname.split('/').count(), 8);
            assert!(path_key
                .pathname
                .split('/')
                .all(|segment| segment.len() == SEGMENT_WIDTH));
        }
    }

    #[test]
    fn test_identity_transform() {
        let path_key = identity_path_transform("foo");
        assert_eq!(path_key.full_path(), "foo/foo");
        assert_eq!(path_key.first_segment(), "foo");
    }

    #[test]
    fn test_file_under_root() {
        let path_key = cas_path_transform("momsbestpicture");
        let file = path_key.file_under(Path::new("/tmp/root"));
        assert!(file.starts_with("/tmp/root/68044/29f74"));
        assert!(file.ends_with("6804429f74181a63c50c3d81d733a12f14a353ff"));
        assert_eq!(file.components().count(), 1 + 2 + 8 + 1);
    }
}
