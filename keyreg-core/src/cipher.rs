//! Key-wrap primitive shared by the sanity marker and data-key records.
//!
//! Wrapping is an AES-CTR keystream XOR seeded by `(master key, iv)`. The
//! counter is the full 128-bit IV incremented big-endian, so applying
//! [`xor_block`] twice with the same key and IV returns the original bytes.
//! The AES variant follows the master key length (16, 24 or 32 bytes).

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::{rngs::OsRng, RngCore};

use crate::error::{RegistryError, RegistryResult};

/// AES block size; every IV in the registry has this length.
pub const IV_SIZE: usize = 16;

/// Master key lengths accepted by [`xor_block`].
pub const SUPPORTED_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// Generates a fresh random IV.
///
/// # Errors
///
/// Returns [`RegistryError::Crypto`] if the OS random source fails.
pub fn generate_iv() -> RegistryResult<[u8; IV_SIZE]> {
    let mut iv = [0u8; IV_SIZE];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|err| RegistryError::Crypto(format!("IV generation failed: {err}")))?;
    Ok(iv)
}

/// Returns `n` bytes from the OS cryptographically secure random source.
///
/// # Errors
///
/// Returns [`RegistryError::Crypto`] if the OS random source fails.
pub fn secure_random_bytes(n: usize) -> RegistryResult<Vec<u8>> {
    let mut bytes = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| RegistryError::Crypto(format!("random generation failed: {err}")))?;
    Ok(bytes)
}

/// XORs `data` with the AES-CTR keystream for `(key, iv)`.
///
/// The operation is its own inverse: the same call encrypts and decrypts.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidEncryptionKey`] if `key` is not 16, 24 or
/// 32 bytes long, and [`RegistryError::Crypto`] if `iv` is not [`IV_SIZE`]
/// bytes long.
pub fn xor_block(data: &[u8], key: &[u8], iv: &[u8]) -> RegistryResult<Vec<u8>> {
    let mut out = data.to_vec();
    match key.len() {
        16 => Ctr128BE::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid_iv)?
            .apply_keystream(&mut out),
        24 => Ctr128BE::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid_iv)?
            .apply_keystream(&mut out),
        32 => Ctr128BE::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid_iv)?
            .apply_keystream(&mut out),
        len => return Err(RegistryError::InvalidEncryptionKey { len }),
    }
    Ok(out)
}

/// Checks that `key` is usable as a master key. An empty key disables encryption.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidEncryptionKey`] for any other length.
pub fn validate_key(key: &[u8]) -> RegistryResult<()> {
    if key.is_empty() || SUPPORTED_KEY_LENGTHS.contains(&key.len()) {
        Ok(())
    } else {
        Err(RegistryError::InvalidEncryptionKey { len: key.len() })
    }
}

fn invalid_iv(err: ctr::cipher::InvalidLength) -> RegistryError {
    RegistryError::Crypto(format!("invalid IV length: {err}"))
}
