//! Registry path helpers.

use std::path::{Path, PathBuf};

/// File name of the canonical key registry.
pub const KEY_REGISTRY_FILENAME: &str = "KEYREGISTRY";

/// File name used while a full rewrite is staged, before the atomic rename.
pub const KEY_REGISTRY_REWRITE_FILENAME: &str = "REWRITE-KEYREGISTRY";

/// Paths for key registry artifacts under a storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPaths {
    dir: PathBuf,
}

impl RegistryPaths {
    /// Builds registry paths rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path to the canonical registry file.
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.dir.join(KEY_REGISTRY_FILENAME)
    }

    /// Returns the path to the rewrite temporary file.
    #[must_use]
    pub fn rewrite_path(&self) -> PathBuf {
        self.dir.join(KEY_REGISTRY_REWRITE_FILENAME)
    }
}
