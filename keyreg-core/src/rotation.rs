//! Data key rotation policy.

use std::time::Duration;

use crate::cipher;
use crate::data_key::DataKey;
use crate::error::RegistryResult;

/// Decides when the latest data key has expired and mints its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    period: Duration,
}

impl RotationPolicy {
    pub const fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Returns `true` if a key created at `last_created` is due for rotation at `now`.
    ///
    /// A clock that runs backwards counts as no time elapsed.
    pub const fn needs_rotation(&self, last_created: u64, now: u64) -> bool {
        now.saturating_sub(last_created) >= self.period.as_secs()
    }

    /// Mints a fresh key with random material of `key_len` bytes and a fresh IV.
    pub fn mint(key_id: u64, key_len: usize, now: u64) -> RegistryResult<DataKey> {
        let data = cipher::secure_random_bytes(key_len)?;
        let iv = cipher::generate_iv()?;
        Ok(DataKey::new(key_id, data, iv, now))
    }
}
