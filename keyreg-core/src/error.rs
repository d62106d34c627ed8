//! Error types for the key registry.

use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised while opening, reading or mutating the key registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The supplied master key does not match the one the registry was created with.
    #[error("encryption key mismatch: the supplied key does not decrypt the registry")]
    EncryptionKeyMismatch,

    /// A lookup asked for a data key id that was never recorded.
    #[error("invalid data key id: {0}")]
    InvalidDataKeyId(u64),

    /// A record frame failed its CRC-32C check during replay.
    #[error("bad checksum in registry record at offset {offset}")]
    BadChecksum {
        /// Byte offset of the offending frame header.
        offset: u64,
    },

    /// The file ends in the middle of a header or record.
    #[error("registry truncated at offset {offset}: {context}")]
    Truncated {
        /// Byte offset where the partial data begins.
        offset: u64,
        /// What was being read.
        context: String,
    },

    /// A record passed its checksum but could not be decoded.
    #[error("corrupted registry record at offset {offset}: {reason}")]
    Corrupted {
        /// Byte offset of the record frame.
        offset: u64,
        /// Description of the malformation.
        reason: String,
    },

    /// The master key has a length no supported cipher accepts.
    #[error("invalid encryption key length {len}: expected 0, 16, 24 or 32 bytes")]
    InvalidEncryptionKey {
        /// Length of the rejected key.
        len: usize,
    },

    /// An I/O operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Context describing the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The highest recorded key id is `u64::MAX`, so no further key can be minted.
    #[error("data key id space exhausted: no id follows {last}")]
    KeyIdOverflow {
        /// Highest id already recorded.
        last: u64,
    },

    /// Cipher setup or secure randomness failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A mutation was requested on a registry opened read-only.
    #[error("key registry is read-only")]
    ReadOnly,

    /// The registry lock was poisoned by a panicking thread.
    #[error("registry lock error: {0}")]
    Lock(String),
}

impl RegistryError {
    /// Creates an I/O error with context.
    #[must_use]
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a truncation error.
    #[must_use]
    pub fn truncated<S: Into<String>>(offset: u64, context: S) -> Self {
        Self::Truncated {
            offset,
            context: context.into(),
        }
    }

    /// Creates a corrupted record error.
    #[must_use]
    pub fn corrupted<S: Into<String>>(offset: u64, reason: S) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that indicate on-disk damage rather than
    /// caller misuse or environmental failure.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::BadChecksum { .. } | Self::Truncated { .. } | Self::Corrupted { .. }
        )
    }
}
