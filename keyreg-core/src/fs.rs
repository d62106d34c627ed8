//! File primitives for the registry file.
//!
//! Full rewrites follow the write-to-temp-then-rename pattern:
//!
//! 1. Write the new content to the rewrite file in the same directory
//! 2. Call `fsync()` on the rewrite file and close it
//! 3. Atomically rename the rewrite file over the registry file
//! 4. Call `fsync()` on the directory so the rename itself is durable
//!
//! Readers therefore observe either the complete old registry or the complete
//! new one. A crash between steps 2 and 3 leaves a stale rewrite file behind,
//! which is never read and is overwritten by the next rewrite.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{RegistryError, RegistryResult};
use crate::paths::RegistryPaths;

/// Open handle on the registry file.
///
/// The handle is positioned at end-of-data after [`RegistryFile::seek_end`];
/// appends are plain sequential writes, never positioned writes.
#[derive(Debug)]
pub struct RegistryFile {
    path: PathBuf,
    file: File,
    read_only: bool,
}

impl RegistryFile {
    /// Opens an existing registry file.
    ///
    /// Returns `Ok(None)` if the file does not exist so callers can fall back
    /// to creating it.
    pub fn open_existing(path: &Path, read_only: bool) -> RegistryResult<Option<Self>> {
        let result = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path);
        match result {
            Ok(file) => Ok(Some(Self {
                path: path.to_path_buf(),
                file,
                read_only,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(RegistryError::io(
                format!("open registry file '{}'", path.display()),
                err,
            )),
        }
    }

    /// Records that the underlying file now lives at `path`.
    ///
    /// Used after the staged rewrite this handle was opened on is renamed
    /// into place; the open descriptor follows the rename.
    pub fn moved_to(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the current file length in bytes.
    pub fn len(&self) -> RegistryResult<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| self.io_error("stat", err))
    }

    /// Reads exactly `len` bytes starting at `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> RegistryResult<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|err| self.io_error("seek", err))?;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact(&mut buf)
            .map_err(|err| self.io_error(format!("read {len} bytes at offset {offset}"), err))?;
        Ok(buf)
    }

    /// Positions the handle at end-of-data and returns that offset.
    pub fn seek_end(&mut self) -> RegistryResult<u64> {
        self.file
            .seek(SeekFrom::End(0))
            .map_err(|err| self.io_error("seek to end", err))
    }

    /// Writes `bytes` at the current position (end-of-data after replay).
    ///
    /// On failure the file is cut back to its previous length so the next
    /// append still starts on a frame boundary.
    pub fn append(&mut self, bytes: &[u8]) -> RegistryResult<()> {
        if self.read_only {
            return Err(RegistryError::ReadOnly);
        }
        let start = self
            .file
            .stream_position()
            .map_err(|err| self.io_error("locate append position", err))?;
        if let Err(err) = self.file.write_all(bytes) {
            if let Err(rollback) = self
                .file
                .set_len(start)
                .and_then(|()| self.file.seek(SeekFrom::Start(start)))
            {
                log::warn!(
                    "could not roll back partial append on '{}': {rollback}",
                    self.path.display()
                );
            }
            return Err(self.io_error("append", err));
        }
        Ok(())
    }

    /// Flushes file data and metadata to durable storage.
    pub fn sync(&self) -> RegistryResult<()> {
        self.file
            .sync_all()
            .map_err(|err| self.io_error("sync", err))
    }

    fn io_error(&self, op: impl std::fmt::Display, err: std::io::Error) -> RegistryError {
        RegistryError::io(format!("{op} on '{}'", self.path.display()), err)
    }
}

/// Creates `path`, truncating any previous content.
pub fn create_truncate(path: &Path) -> RegistryResult<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|err| RegistryError::io(format!("create '{}'", path.display()), err))
}

/// Atomically replaces the registry file with `bytes`.
pub fn write_atomic(paths: &RegistryPaths, bytes: &[u8]) -> RegistryResult<()> {
    stage_rewrite(paths, bytes)?;
    publish_rewrite(paths)
}

/// Writes `bytes` to the rewrite file and makes them durable.
///
/// The canonical registry file is untouched until [`publish_rewrite`].
pub fn stage_rewrite(paths: &RegistryPaths, bytes: &[u8]) -> RegistryResult<()> {
    let temp_path = paths.rewrite_path();
    let mut file = create_truncate(&temp_path)?;

    file.write_all(bytes).map_err(|err| {
        RegistryError::io(format!("write rewrite file '{}'", temp_path.display()), err)
    })?;
    file.sync_all().map_err(|err| {
        RegistryError::io(format!("sync rewrite file '{}'", temp_path.display()), err)
    })?;

    // Close before renaming.
    drop(file);
    Ok(())
}

/// Renames the staged rewrite file over the registry file and syncs the directory.
pub fn publish_rewrite(paths: &RegistryPaths) -> RegistryResult<()> {
    rename_rewrite(paths)?;
    sync_dir(paths.dir())
}

/// Renames the staged rewrite file over the registry file.
///
/// Once this returns `Ok` the new content is the registry, even if the
/// following directory sync fails.
pub fn rename_rewrite(paths: &RegistryPaths) -> RegistryResult<()> {
    let temp_path = paths.rewrite_path();
    let final_path = paths.registry_path();
    fs::rename(&temp_path, &final_path).map_err(|err| {
        RegistryError::io(
            format!(
                "rename '{}' to '{}'",
                temp_path.display(),
                final_path.display()
            ),
            err,
        )
    })
}

#[cfg(test)]
thread_local! {
    /// Makes the next [`sync_dir`] on this thread fail.
    pub static FAIL_NEXT_DIR_SYNC: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Syncs a directory so that entries created or renamed in it are durable.
pub fn sync_dir(dir: &Path) -> RegistryResult<()> {
    #[cfg(test)]
    if FAIL_NEXT_DIR_SYNC.with(|flag| flag.replace(false)) {
        return Err(RegistryError::io(
            format!("sync directory '{}'", dir.display()),
            std::io::Error::other("injected directory sync failure"),
        ));
    }
    sync_dir_handle(dir)
}

#[cfg(unix)]
fn sync_dir_handle(dir: &Path) -> RegistryResult<()> {
    let handle = File::open(dir).map_err(|err| {
        RegistryError::io(format!("open directory '{}' for sync", dir.display()), err)
    })?;
    handle
        .sync_all()
        .map_err(|err| RegistryError::io(format!("sync directory '{}'", dir.display()), err))
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn sync_dir_handle(_dir: &Path) -> RegistryResult<()> {
    // Directory handles cannot be synced here; rename is still atomic.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opened = RegistryFile::open_existing(&dir.path().join("KEYREGISTRY"), false)
            .expect("open");
        assert!(opened.is_none());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RegistryPaths::new(dir.path());

        write_atomic(&paths, b"first").expect("write first");
        write_atomic(&paths, b"second").expect("write second");

        assert_eq!(fs::read(paths.registry_path()).expect("read"), b"second");
        assert!(!paths.rewrite_path().exists());
    }

    #[test]
    fn test_staged_rewrite_leaves_original_intact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RegistryPaths::new(dir.path());

        write_atomic(&paths, b"original").expect("write");
        stage_rewrite(&paths, b"replacement").expect("stage");

        assert_eq!(fs::read(paths.registry_path()).expect("read"), b"original");
        assert_eq!(fs::read(paths.rewrite_path()).expect("read"), b"replacement");

        publish_rewrite(&paths).expect("publish");
        assert_eq!(fs::read(paths.registry_path()).expect("read"), b"replacement");
        assert!(!paths.rewrite_path().exists());
    }

    #[test]
    fn test_handle_on_staged_file_follows_rename() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RegistryPaths::new(dir.path());
        write_atomic(&paths, b"old").expect("write");
        stage_rewrite(&paths, b"new").expect("stage");

        let mut staged = RegistryFile::open_existing(&paths.rewrite_path(), false)
            .expect("open")
            .expect("exists");
        rename_rewrite(&paths).expect("rename");
        staged.moved_to(paths.registry_path());

        staged.seek_end().expect("seek");
        staged.append(b"+tail").expect("append");
        staged.sync().expect("sync");
        assert_eq!(fs::read(paths.registry_path()).expect("read"), b"new+tail");
    }

    #[test]
    fn test_injected_dir_sync_failure_is_one_shot() {
        let dir = tempfile::tempdir().expect("tempdir");
        FAIL_NEXT_DIR_SYNC.with(|flag| flag.set(true));
        assert!(matches!(sync_dir(dir.path()), Err(RegistryError::Io { .. })));
        assert!(sync_dir(dir.path()).is_ok());
    }

    #[test]
    fn test_read_at_and_append() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RegistryPaths::new(dir.path());
        write_atomic(&paths, b"header").expect("write");

        let mut file = RegistryFile::open_existing(&paths.registry_path(), false)
            .expect("open")
            .expect("exists");
        assert_eq!(file.len().expect("len"), 6);
        assert_eq!(file.read_at(2, 4).expect("read"), b"ader");

        assert_eq!(file.seek_end().expect("seek"), 6);
        file.append(b"+record").expect("append");
        file.sync().expect("sync");
        assert_eq!(file.read_at(0, 13).expect("read"), b"header+record");

        let err = file.read_at(10, 8).expect_err("past eof");
        assert!(matches!(err, RegistryError::Io { .. }));
    }

    #[test]
    fn test_read_only_handle_refuses_append() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RegistryPaths::new(dir.path());
        write_atomic(&paths, b"header").expect("write");

        let mut file = RegistryFile::open_existing(&paths.registry_path(), true)
            .expect("open")
            .expect("exists");
        assert!(file.is_read_only());
        assert!(matches!(file.append(b"x"), Err(RegistryError::ReadOnly)));
    }
}
