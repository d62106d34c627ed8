//! In-memory data key type.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::IV_SIZE;

/// A single generation of data-encryption key.
///
/// The key material is always held decrypted in memory and is wiped when the
/// value is dropped. Wrapping under the master key only happens on the way to
/// disk.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key_id: u64,
    data: Vec<u8>,
    iv: [u8; IV_SIZE],
    created_at: u64,
}

impl DataKey {
    /// Creates a data key from its parts.
    #[must_use]
    pub const fn new(key_id: u64, data: Vec<u8>, iv: [u8; IV_SIZE], created_at: u64) -> Self {
        Self {
            key_id,
            data,
            iv,
            created_at,
        }
    }

    /// Returns the key identifier. Identifiers start at 1; 0 means "unencrypted".
    #[must_use]
    pub const fn key_id(&self) -> u64 {
        self.key_id
    }

    /// Returns the plaintext key material. Treat this as sensitive.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the IV used to wrap this key in its most recent on-disk record.
    #[must_use]
    pub const fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Returns the creation time in Unix seconds.
    #[must_use]
    pub const fn created_at(&self) -> u64 {
        self.created_at
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("key_id", &self.key_id)
            .field("data", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
