//! Options consumed when opening a key registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use zeroize::Zeroizing;

use crate::cipher;
use crate::error::RegistryResult;
use crate::paths::RegistryPaths;

/// Default interval after which a new data key is minted (10 days).
pub const DEFAULT_ROTATION_PERIOD: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Configuration for [`KeyRegistry::open`](crate::KeyRegistry::open).
///
/// An empty encryption key (the default) disables encryption: no data keys
/// are minted and records are stored in clear.
#[derive(Clone)]
pub struct RegistryOptions {
    dir: PathBuf,
    encryption_key: Zeroizing<Vec<u8>>,
    read_only: bool,
    rotation_period: Duration,
}

impl RegistryOptions {
    /// Creates options for the registry in `dir` with encryption disabled.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            encryption_key: Zeroizing::new(Vec::new()),
            read_only: false,
            rotation_period: DEFAULT_ROTATION_PERIOD,
        }
    }

    /// Sets the master key used to wrap data keys.
    #[must_use]
    pub fn with_encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_key = Zeroizing::new(key.into());
        self
    }

    /// Opens the registry without write access.
    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Overrides the data key rotation period.
    #[must_use]
    pub const fn with_rotation_period(mut self, period: Duration) -> Self {
        self.rotation_period = period;
        self
    }

    /// Returns the storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the registry paths for the storage directory.
    #[must_use]
    pub fn paths(&self) -> RegistryPaths {
        RegistryPaths::new(&self.dir)
    }

    /// Returns the master key. Treat this as sensitive.
    #[must_use]
    pub fn encryption_key(&self) -> &[u8] {
        &self.encryption_key
    }

    /// Returns whether the registry is opened read-only.
    #[must_use]
    pub const fn read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the data key rotation period.
    #[must_use]
    pub const fn rotation_period(&self) -> Duration {
        self.rotation_period
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidEncryptionKey`](crate::RegistryError::InvalidEncryptionKey)
    /// if the master key is not 0, 16, 24 or 32 bytes long.
    pub fn validate(&self) -> RegistryResult<()> {
        cipher::validate_key(&self.encryption_key)
    }
}

impl std::fmt::Debug for RegistryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryOptions")
            .field("dir", &self.dir)
            .field("encryption_key", &"[REDACTED]")
            .field("read_only", &self.read_only)
            .field("rotation_period", &self.rotation_period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegistryError;

    #[test]
    fn test_defaults() {
        let options = RegistryOptions::new("/tmp/engine");
        assert!(options.encryption_key().is_empty());
        assert!(!options.read_only());
        assert_eq!(options.rotation_period(), Duration::from_secs(864_000));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_odd_key_length() {
        let options = RegistryOptions::new("/tmp/engine").with_encryption_key(vec![1u8; 12]);
        assert!(matches!(
            options.validate(),
            Err(RegistryError::InvalidEncryptionKey { len: 12 })
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let options = RegistryOptions::new("/tmp/engine").with_encryption_key(b"0123456789abcdef".to_vec());
        let rendered = format!("{options:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("0123456789abcdef"));
    }
}
