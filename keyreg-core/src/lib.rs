//! Data-key registry for an embedded key-value engine with encryption at rest.
//!
//! The registry owns a single append-mostly file (`KEYREGISTRY`) in the storage
//! directory. It records every *data key* the engine has ever used to encrypt
//! blocks, each one wrapped under the operator-supplied *master key*.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  IV (16 bytes)                           │  offset 0
//! ├──────────────────────────────────────────┤
//! │  sanity marker (16 bytes, encrypted)     │  offset 16
//! ├──────────────────────────────────────────┤
//! │  len (u32 BE) | crc32c (u32 BE) | record │
//! │  len (u32 BE) | crc32c (u32 BE) | record │
//! │  ...                                     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Opening the registry verifies the master key against the sanity marker and
//! replays every record. [`KeyRegistry::latest_data_key`] serves the current
//! key and mints a new one once the rotation period has elapsed.
//!
//! ```no_run
//! use keyreg_core::{KeyRegistry, RegistryOptions};
//!
//! # fn main() -> Result<(), keyreg_core::RegistryError> {
//! let options = RegistryOptions::new("/var/lib/engine").with_encryption_key(vec![7u8; 32]);
//! let registry = KeyRegistry::open(&options)?;
//! let key = registry.latest_data_key()?.expect("encryption is enabled");
//! assert_eq!(registry.data_key(key.key_id())?.as_deref(), Some(&*key));
//! registry.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cipher;
mod codec;
mod data_key;
pub mod error;
mod fs;
pub mod logger;
mod options;
mod paths;
mod registry;
mod rotation;

pub use data_key::DataKey;
pub use error::{RegistryError, RegistryResult};
pub use options::{RegistryOptions, DEFAULT_ROTATION_PERIOD};
pub use paths::{RegistryPaths, KEY_REGISTRY_FILENAME, KEY_REGISTRY_REWRITE_FILENAME};
pub use registry::KeyRegistry;
