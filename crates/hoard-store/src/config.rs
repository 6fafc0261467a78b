//! Storage configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::path::{cas_path_transform, PathTransform};

/// Root folder used when none is configured.
pub const DEFAULT_ROOT_FOLDER_NAME: &str = "hoardnetwork";

/// Storage configuration.
#[derive(Clone)]
pub struct StoreConfig {
    /// Directory all keys live under
    pub root: PathBuf,
    /// Key to path mapping
    pub path_transform: PathTransform,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT_FOLDER_NAME),
            path_transform: Arc::new(cas_path_transform),
        }
    }
}

impl StoreConfig {
    /// Creates a content-addressed configuration under `root`.
    ///
    /// An empty `root` falls back to [`DEFAULT_ROOT_FOLDER_NAME`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            root: if root.as_os_str().is_empty() {
                PathBuf::from(DEFAULT_ROOT_FOLDER_NAME)
            } else {
                root
            },
            ..Default::default()
        }
    }

    /// Replaces the path transform.
    pub fn with_path_transform(mut self, transform: PathTransform) -> Self {
        self.path_transform = transform;
        self
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::identity_path_transform;

    #[test]
    fn test_empty_root_uses_default() {
        let config = StoreConfig::new("");
        assert_eq!(config.root, PathBuf::from(DEFAULT_ROOT_FOLDER_NAME));
    }

    #[test]
    fn test_custom_transform() {
        let config = StoreConfig::new("/tmp/hoard").with_path_transform(Arc::new(identity_path_transform));
        assert_eq!(config.root, PathBuf::from("/tmp/hoard"));
        assert_eq!((config.path_transform)("abc").full_path(), "abc/abc");
    }
}
