//! The key registry: bootstrap, lookups, rotation and full rewrites.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cipher;
use crate::codec::{self, RecordReader};
use crate::data_key::DataKey;
use crate::error::{RegistryError, RegistryResult};
use crate::fs::{self, RegistryFile};
use crate::options::RegistryOptions;
use crate::paths::RegistryPaths;
use crate::rotation::RotationPolicy;

/// Registry of data keys for one storage directory.
///
/// All state, including the open file handle, lives behind a single
/// reader/writer lock. Lookups share the read lock; rotation and rewrites
/// hold the write lock from the expiry check until the new state is
/// installed, so concurrent callers never mint more than one key per period.
///
/// `KeyRegistry` is `Send + Sync`; share it with `Arc`.
pub struct KeyRegistry {
    paths: RegistryPaths,
    read_only: bool,
    policy: RotationPolicy,
    state: RwLock<RegistryState>,
}

struct RegistryState {
    data_keys: HashMap<u64, Arc<DataKey>>,
    next_key_id: u64,
    last_created: u64,
    encryption_key: Zeroizing<Vec<u8>>,
    file: Option<RegistryFile>,
}

impl RegistryState {
    fn empty(encryption_key: &[u8]) -> Self {
        Self {
            data_keys: HashMap::new(),
            next_key_id: 0,
            last_created: 0,
            encryption_key: Zeroizing::new(encryption_key.to_vec()),
            file: None,
        }
    }

    /// Verifies the header and loads every record from `file`.
    fn replay(&mut self, file: &mut RegistryFile) -> RegistryResult<()> {
        let len = usize::try_from(file.len()?)
            .map_err(|_| RegistryError::corrupted(0, "registry file exceeds address space"))?;
        let bytes = Zeroizing::new(file.read_at(0, len)?);

        let start = codec::verify_header(&bytes, &self.encryption_key)?;
        let mut reader = RecordReader::new(&bytes, start, &self.encryption_key);
        for item in &mut reader {
            let (offset, key) = item?;
            let key_id = key.key_id();
            self.next_key_id = self.next_key_id.max(key_id);
            self.last_created = self.last_created.max(key.created_at());
            if self.data_keys.insert(key_id, Arc::new(key)).is_some() {
                warn!("duplicate record for data key {key_id} at offset {offset}; keeping the later one");
            }
        }
        debug!(
            "replayed {} data keys from {} bytes",
            self.data_keys.len(),
            reader.position()
        );
        Ok(())
    }

    fn current_key(&self) -> RegistryResult<Arc<DataKey>> {
        self.data_keys
            .get(&self.next_key_id)
            .cloned()
            .ok_or(RegistryError::InvalidDataKeyId(self.next_key_id))
    }

    fn is_current(&self, policy: RotationPolicy, now: u64) -> bool {
        self.next_key_id != 0 && !policy.needs_rotation(self.last_created, now)
    }

    /// Keys ordered by id, each with a freshly generated record IV.
    fn rewrapped_keys(&self) -> RegistryResult<Vec<DataKey>> {
        let mut keys: Vec<&Arc<DataKey>> = self.data_keys.values().collect();
        keys.sort_by_key(|key| key.key_id());
        keys.into_iter()
            .map(|key| {
                Ok(DataKey::new(
                    key.key_id(),
                    key.data().to_vec(),
                    cipher::generate_iv()?,
                    key.created_at(),
                ))
            })
            .collect()
    }
}

impl KeyRegistry {
    /// Opens the registry in the options' directory, creating it if absent.
    ///
    /// A read-only open of a directory without a registry yields an empty
    /// registry and creates nothing.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidEncryptionKey`] if the master key length is unsupported
    /// - [`RegistryError::EncryptionKeyMismatch`] if the master key does not match the file
    /// - [`RegistryError::BadChecksum`], [`RegistryError::Truncated`] or
    ///   [`RegistryError::Corrupted`] if the file is damaged
    /// - [`RegistryError::Io`] on filesystem failures
    pub fn open(options: &RegistryOptions) -> RegistryResult<Self> {
        options.validate()?;
        let paths = options.paths();
        let read_only = options.read_only();

        if paths.rewrite_path().exists() {
            warn!(
                "ignoring stale rewrite file '{}'",
                paths.rewrite_path().display()
            );
        }

        let mut state = RegistryState::empty(options.encryption_key());
        match RegistryFile::open_existing(&paths.registry_path(), read_only)? {
            Some(file) => state.file = Some(file),
            None if read_only => {
                debug!(
                    "no key registry in '{}'; opened empty and read-only",
                    paths.dir().display()
                );
            }
            None => {
                let bytes = codec::encode_registry(std::iter::empty(), options.encryption_key())?;
                fs::write_atomic(&paths, &bytes)?;
                info!("created key registry in '{}'", paths.dir().display());
                state.file = Some(reopen(&paths.registry_path())?);
            }
        }

        if let Some(mut file) = state.file.take() {
            state.replay(&mut file)?;
            file.seek_end()?;
            state.file = Some(file);
        }

        Ok(Self {
            paths,
            read_only,
            policy: RotationPolicy::new(options.rotation_period()),
            state: RwLock::new(state),
        })
    }

    /// Returns the data key with `key_id`.
    ///
    /// Id 0 marks unencrypted data and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidDataKeyId`] if no key with that id was recorded.
    pub fn data_key(&self, key_id: u64) -> RegistryResult<Option<Arc<DataKey>>> {
        if key_id == 0 {
            return Ok(None);
        }
        let state = self.read_state()?;
        state
            .data_keys
            .get(&key_id)
            .cloned()
            .map(Some)
            .ok_or(RegistryError::InvalidDataKeyId(key_id))
    }

    /// Returns the current data key, minting a new one if the rotation period has elapsed.
    ///
    /// Returns `Ok(None)` when encryption is disabled.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::ReadOnly`] if a new key is due on a read-only registry
    /// - [`RegistryError::KeyIdOverflow`] if a new key is due and id `u64::MAX` is taken
    /// - [`RegistryError::Io`] if the new record cannot be persisted; the registry is unchanged
    /// - [`RegistryError::Crypto`] if secure randomness is unavailable
    pub fn latest_data_key(&self) -> RegistryResult<Option<Arc<DataKey>>> {
        self.latest_data_key_at(unix_now())
    }

    /// Same as [`KeyRegistry::latest_data_key`] with an explicit clock in Unix seconds.
    ///
    /// # Errors
    ///
    /// See [`KeyRegistry::latest_data_key`].
    pub fn latest_data_key_at(&self, now: u64) -> RegistryResult<Option<Arc<DataKey>>> {
        {
            let state = self.read_state()?;
            if state.encryption_key.is_empty() {
                return Ok(None);
            }
            if state.is_current(self.policy, now) {
                return state.current_key().map(Some);
            }
        }

        let mut state = self.write_state()?;
        // Another caller may have rotated while the lock was released.
        if state.encryption_key.is_empty() {
            return Ok(None);
        }
        if state.is_current(self.policy, now) {
            return state.current_key().map(Some);
        }
        if self.read_only {
            return Err(RegistryError::ReadOnly);
        }

        let key_id = state
            .next_key_id
            .checked_add(1)
            .ok_or(RegistryError::KeyIdOverflow {
                last: state.next_key_id,
            })?;
        let key = RotationPolicy::mint(key_id, state.encryption_key.len(), now)?;
        let record = codec::encode_record(&key, &state.encryption_key)?;
        let file = state.file.as_mut().ok_or(RegistryError::ReadOnly)?;
        file.append(&record)?;
        file.sync()?;

        let key = Arc::new(key);
        state.data_keys.insert(key_id, Arc::clone(&key));
        state.next_key_id = key_id;
        state.last_created = now;
        drop(state);

        info!("rotated to data key {key_id}");
        Ok(Some(key))
    }

    /// Rewrites the registry into `options.dir()` wrapped under `options`' master key.
    ///
    /// Every record gets a fresh IV. The target file is replaced atomically.
    /// When the target is this registry's own directory, the open handle is
    /// moved to the new file and the new master key is adopted, so later
    /// rotations append under it.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidEncryptionKey`] if the new master key length is unsupported
    /// - [`RegistryError::ReadOnly`] when rewriting this registry's own directory read-only
    /// - [`RegistryError::Io`] on filesystem failures. Failures before the
    ///   rename leave the previous file and state intact. If only the final
    ///   directory sync fails, the new file and master key are already in use.
    pub fn write_registry(&self, options: &RegistryOptions) -> RegistryResult<()> {
        options.validate()?;
        let target = options.paths();
        let in_place = same_dir(target.dir(), self.paths.dir());
        if in_place && self.read_only {
            return Err(RegistryError::ReadOnly);
        }

        let mut state = self.write_state()?;
        let keys = state.rewrapped_keys()?;
        let bytes = Zeroizing::new(codec::encode_registry(&keys, options.encryption_key())?);

        if !in_place {
            fs::write_atomic(&target, &bytes)?;
            drop(state);
            info!(
                "wrote {} data keys to '{}'",
                keys.len(),
                target.dir().display()
            );
            return Ok(());
        }

        // Open the append handle before the rename. Once the new file is
        // published the state must never point at the old inode.
        fs::stage_rewrite(&target, &bytes)?;
        let mut file = reopen(&target.rewrite_path())?;
        file.seek_end()?;
        fs::rename_rewrite(&target)?;
        file.moved_to(target.registry_path());

        state.file = Some(file);
        state.encryption_key = Zeroizing::new(options.encryption_key().to_vec());
        state.data_keys = keys
            .into_iter()
            .map(|key| (key.key_id(), Arc::new(key)))
            .collect();
        let count = state.data_keys.len();
        let synced = fs::sync_dir(target.dir());
        drop(state);
        synced?;

        info!("re-keyed registry in '{}' ({count} data keys)", target.dir().display());
        Ok(())
    }

    /// Re-wraps every data key under `new_key` in place. An empty key stores them in clear.
    ///
    /// # Errors
    ///
    /// See [`KeyRegistry::write_registry`].
    pub fn rekey(&self, new_key: impl Into<Vec<u8>>) -> RegistryResult<()> {
        let options = RegistryOptions::new(self.paths.dir()).with_encryption_key(new_key);
        self.write_registry(&options)
    }

    /// Syncs and closes the registry file.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the final sync fails.
    pub fn close(self) -> RegistryResult<()> {
        let state = self
            .state
            .into_inner()
            .map_err(|err| RegistryError::Lock(err.to_string()))?;
        if let Some(file) = &state.file {
            if !file.is_read_only() {
                file.sync()?;
            }
        }
        debug!("closed key registry in '{}'", self.paths.dir().display());
        Ok(())
    }

    /// Returns the ids of all recorded data keys in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Lock`] if the lock is poisoned.
    pub fn key_ids(&self) -> RegistryResult<Vec<u64>> {
        let mut ids: Vec<u64> = self.read_state()?.data_keys.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Returns the number of recorded data keys.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Lock`] if the lock is poisoned.
    pub fn len(&self) -> RegistryResult<usize> {
        Ok(self.read_state()?.data_keys.len())
    }

    /// Returns `true` if no data key has been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Lock`] if the lock is poisoned.
    pub fn is_empty(&self) -> RegistryResult<bool> {
        Ok(self.read_state()?.data_keys.is_empty())
    }

    /// Returns the highest key id assigned so far (0 when none).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Lock`] if the lock is poisoned.
    pub fn next_key_id(&self) -> RegistryResult<u64> {
        Ok(self.read_state()?.next_key_id)
    }

    /// Returns the creation time of the newest key in Unix seconds (0 when none).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Lock`] if the lock is poisoned.
    pub fn last_created_at(&self) -> RegistryResult<u64> {
        Ok(self.read_state()?.last_created)
    }

    /// Returns `true` if a master key is configured.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Lock`] if the lock is poisoned.
    pub fn is_encrypted(&self) -> RegistryResult<bool> {
        Ok(!self.read_state()?.encryption_key.is_empty())
    }

    /// Returns `true` if the registry was opened read-only.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the registry's file paths.
    #[must_use]
    pub const fn paths(&self) -> &RegistryPaths {
        &self.paths
    }

    fn read_state(&self) -> RegistryResult<RwLockReadGuard<'_, RegistryState>> {
        self.state
            .read()
            .map_err(|err| RegistryError::Lock(err.to_string()))
    }

    fn write_state(&self) -> RegistryResult<RwLockWriteGuard<'_, RegistryState>> {
        self.state
            .write()
            .map_err(|err| RegistryError::Lock(err.to_string()))
    }
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("dir", &self.paths.dir())
            .field("read_only", &self.read_only)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn reopen(path: &Path) -> RegistryResult<RegistryFile> {
    RegistryFile::open_existing(path, false)?.ok_or_else(|| {
        RegistryError::io(
            format!("reopen '{}'", path.display()),
            std::io::ErrorKind::NotFound.into(),
        )
    })
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Current time in Unix seconds; 0 if the clock is before the epoch.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
