//! storage::lock
//!
//! Advisory exclusive lock over a save root.
//!
//! Every mutating disk operation (flush, refresh, clear) takes the lock
//! for its duration, so two processes sharing a save root cannot
//! interleave partial writes. The lock is advisory: readers that do not
//! take it see whole files only because writes are atomic renames.

use std::fs::OpenOptions;
use std::path::PathBuf;

use fs2::FileExt;
use tracing::debug;

use super::StorageError;

/// RAII guard over the save root's lock file. Released on drop.
#[derive(Debug)]
pub struct StorageLock {
    file: std::fs::File,
    path: PathBuf,
}

impl StorageLock {
    /// Acquire the exclusive lock, failing fast when another holder exists.
    ///
    /// # Errors
    ///
    /// `StorageError::AlreadyLocked` when the lock is held elsewhere;
    /// `StorageError::Io` when the lock file cannot be opened.
    pub fn acquire(path: PathBuf) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;

        file.try_lock_exclusive()
            .map_err(|_| StorageError::AlreadyLocked { path: path.clone() })?;

        debug!(path = %path.display(), "storage lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "failed to release storage lock");
        } else {
            debug!(path = %self.path.display(), "storage lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".keepsake.lock");

        let held = StorageLock::acquire(path.clone()).unwrap();
        assert!(matches!(
            StorageLock::acquire(path.clone()),
            Err(StorageError::AlreadyLocked { .. })
        ));

        drop(held);
        StorageLock::acquire(path).unwrap();
    }
}
