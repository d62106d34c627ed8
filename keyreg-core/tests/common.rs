//! Common test utilities shared across integration tests.

use std::path::Path;

use keyreg_core::{KeyRegistry, RegistryOptions};
use tempfile::TempDir;

/// Fixed "current" timestamp used by tests.
pub const NOW: u64 = 1_700_000_000;
/// Seconds in a day.
pub const DAY: u64 = 24 * 60 * 60;

/// Size of the IV + sanity marker header.
pub const HEADER_SIZE: usize = 32;

/// Size of the length + checksum prefix of each record.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Creates a fresh temporary directory.
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("tempdir")
}

/// Returns a 32-byte master key filled with `byte`.
pub fn master_key(byte: u8) -> Vec<u8> {
    vec![byte; 32]
}

/// Registry options for `dir` encrypted with `master_key(byte)`.
pub fn keyed_options(dir: &Path, byte: u8) -> RegistryOptions {
    RegistryOptions::new(dir).with_encryption_key(master_key(byte))
}

/// Opens a registry under `key` and mints `count` keys, one per rotation period.
#[allow(dead_code)] // not every test binary uses it
pub fn registry_with_keys(dir: &Path, key: &[u8], count: u64) -> KeyRegistry {
    let options = RegistryOptions::new(dir).with_encryption_key(key.to_vec());
    let registry = KeyRegistry::open(&options).expect("open");
    for i in 0..count {
        registry
            .latest_data_key_at(NOW + i * 10 * DAY)
            .expect("latest")
            .expect("key");
    }
    registry
}

/// Reads the raw registry file.
#[allow(dead_code)] // not every test binary uses it
pub fn read_registry(dir: &Path) -> Vec<u8> {
    std::fs::read(dir.join(keyreg_core::KEY_REGISTRY_FILENAME)).expect("read registry")
}

/// Overwrites the raw registry file.
#[allow(dead_code)] // not every test binary uses it
pub fn write_registry_bytes(dir: &Path, bytes: &[u8]) {
    std::fs::write(dir.join(keyreg_core::KEY_REGISTRY_FILENAME), bytes).expect("write registry");
}
