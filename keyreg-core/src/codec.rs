//! Binary codec for the registry file.
//!
//! # Header
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       16    iv
//! 16      16    sanity marker (xor_block(SANITY_TEXT, master, iv) when keyed)
//! ```
//!
//! # Frame
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     payload_len (u32 BE)
//! 4       4     crc32c(payload) (u32 BE)
//! 8       N     payload
//! ```
//!
//! # Payload
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       8     key_id (u64 BE)
//! 8       8     created_at (u64 BE)
//! 16      16    iv
//! 32      4     data_len (u32 BE)
//! 36      N     data (wrapped when keyed)
//! ```

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::cipher::{self, IV_SIZE};
use crate::data_key::DataKey;
use crate::error::{RegistryError, RegistryResult};

/// Known plaintext used to verify the master key on open.
pub const SANITY_TEXT: &[u8; 16] = b"keyreg-sanity-v1";

/// Size of the file header (IV + sanity marker).
pub const HEADER_SIZE: usize = IV_SIZE + SANITY_TEXT.len();

/// Size of a frame header (length + checksum).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Size of the fixed part of a record payload.
const PAYLOAD_FIXED_SIZE: usize = 8 + 8 + IV_SIZE + 4;

/// Encodes a file header under a freshly generated IV.
pub fn encode_header(master_key: &[u8]) -> RegistryResult<Vec<u8>> {
    let iv = cipher::generate_iv()?;
    let marker = if master_key.is_empty() {
        SANITY_TEXT.to_vec()
    } else {
        cipher::xor_block(SANITY_TEXT, master_key, &iv)?
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(&iv);
    buf.extend_from_slice(&marker);
    Ok(buf)
}

/// Verifies the header against `master_key`.
///
/// Returns the offset of the first frame.
pub fn verify_header(bytes: &[u8], master_key: &[u8]) -> RegistryResult<usize> {
    if bytes.len() < HEADER_SIZE {
        return Err(RegistryError::truncated(
            0,
            format!(
                "registry header needs {HEADER_SIZE} bytes, file has {}",
                bytes.len()
            ),
        ));
    }
    let iv = &bytes[..IV_SIZE];
    let stored = &bytes[IV_SIZE..HEADER_SIZE];

    let marker = if master_key.is_empty() {
        stored.to_vec()
    } else {
        cipher::xor_block(stored, master_key, iv)?
    };
    if !bool::from(marker.as_slice().ct_eq(SANITY_TEXT.as_slice())) {
        return Err(RegistryError::EncryptionKeyMismatch);
    }
    Ok(HEADER_SIZE)
}

/// Encodes one framed record, wrapping the key material when keyed.
///
/// `key` keeps its plaintext; only the serialization copy is wrapped.
pub fn encode_record(key: &DataKey, master_key: &[u8]) -> RegistryResult<Vec<u8>> {
    let data = if master_key.is_empty() {
        Zeroizing::new(key.data().to_vec())
    } else {
        Zeroizing::new(cipher::xor_block(key.data(), master_key, key.iv())?)
    };
    let data_len = u32::try_from(data.len())
        .map_err(|_| RegistryError::Crypto(format!("data key of {} bytes", data.len())))?;

    let mut payload = Zeroizing::new(Vec::with_capacity(PAYLOAD_FIXED_SIZE + data.len()));
    payload.extend_from_slice(&key.key_id().to_be_bytes());
    payload.extend_from_slice(&key.created_at().to_be_bytes());
    payload.extend_from_slice(key.iv());
    payload.extend_from_slice(&data_len.to_be_bytes());
    payload.extend_from_slice(&data);

    let payload_len = u32::try_from(payload.len())
        .map_err(|_| RegistryError::Crypto(format!("record of {} bytes", payload.len())))?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&crc32c::crc32c(&payload).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encodes a complete registry file: header followed by one record per key.
pub fn encode_registry<'a, I>(keys: I, master_key: &[u8]) -> RegistryResult<Vec<u8>>
where
    I: IntoIterator<Item = &'a DataKey>,
{
    let mut buf = encode_header(master_key)?;
    for key in keys {
        buf.extend_from_slice(&encode_record(key, master_key)?);
    }
    Ok(buf)
}

/// Iterator over the records of a registry file body.
///
/// Yields `(frame_offset, key)` pairs with key material already unwrapped.
/// Iteration stops after the first error.
pub struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    master_key: &'a [u8],
    failed: bool,
}

impl<'a> RecordReader<'a> {
    /// Reads records from `bytes` starting at `start`.
    pub const fn new(bytes: &'a [u8], start: usize, master_key: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: start,
            master_key,
            failed: false,
        }
    }

    /// Offset just past the last record consumed.
    pub const fn position(&self) -> usize {
        self.pos
    }

    fn next_record(&mut self) -> RegistryResult<DataKey> {
        let offset = self.pos;
        let remaining = &self.bytes[offset..];
        if remaining.len() < FRAME_HEADER_SIZE {
            return Err(RegistryError::truncated(
                offset as u64,
                format!("frame header ({} of {FRAME_HEADER_SIZE} bytes)", remaining.len()),
            ));
        }

        let payload_len = usize::try_from(read_u32(remaining, 0))
            .map_err(|_| RegistryError::corrupted(offset as u64, "payload length overflow"))?;
        let stored_crc = read_u32(remaining, 4);

        let body = &remaining[FRAME_HEADER_SIZE..];
        if body.len() < payload_len {
            return Err(RegistryError::truncated(
                offset as u64,
                format!("record payload ({} of {payload_len} bytes)", body.len()),
            ));
        }
        let payload = &body[..payload_len];
        if crc32c::crc32c(payload) != stored_crc {
            return Err(RegistryError::BadChecksum {
                offset: offset as u64,
            });
        }

        let key = decode_payload(offset as u64, payload, self.master_key)?;
        self.pos = offset + FRAME_HEADER_SIZE + payload_len;
        Ok(key)
    }
}

impl Iterator for RecordReader<'_> {
    type Item = RegistryResult<(u64, DataKey)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }
        let offset = self.pos as u64;
        let result = self.next_record();
        self.failed = result.is_err();
        Some(result.map(|key| (offset, key)))
    }
}

fn decode_payload(offset: u64, payload: &[u8], master_key: &[u8]) -> RegistryResult<DataKey> {
    if payload.len() < PAYLOAD_FIXED_SIZE {
        return Err(RegistryError::corrupted(
            offset,
            format!(
                "payload of {} bytes is shorter than {PAYLOAD_FIXED_SIZE}",
                payload.len()
            ),
        ));
    }

    let key_id = read_u64(payload, 0);
    if key_id == 0 {
        return Err(RegistryError::corrupted(offset, "key id 0 is reserved"));
    }
    let created_at = read_u64(payload, 8);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&payload[16..16 + IV_SIZE]);
    let data_len = read_u32(payload, 32);

    let stored = &payload[PAYLOAD_FIXED_SIZE..];
    if usize::try_from(data_len).ok() != Some(stored.len()) {
        return Err(RegistryError::corrupted(
            offset,
            format!(
                "declared data length {data_len} but {} bytes follow",
                stored.len()
            ),
        ));
    }

    let data = if master_key.is_empty() {
        stored.to_vec()
    } else {
        cipher::xor_block(stored, master_key, &iv)?
    };
    Ok(DataKey::new(key_id, data, iv, created_at))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}
