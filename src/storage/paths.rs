//! storage::paths
//!
//! Filesystem layout of a save root: one file per capsule plus a lock
//! file, all under a single directory.

use std::path::{Path, PathBuf};

use crate::core::types::CapsuleId;

use super::StorageError;

/// File extension for capsule save files.
pub const FILE_EXTENSION: &str = "ksf";

/// Lock file name inside the save root.
const LOCK_FILE: &str = ".keepsake.lock";

/// Resolved locations for one save root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Paths rooted at an explicit directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Paths under the platform data directory, namespaced by application
    /// name.
    ///
    /// # Errors
    ///
    /// `StorageError::NoDataDir` when the platform exposes no data
    /// directory.
    pub fn for_app(app_name: &str) -> Result<Self, StorageError> {
        let base = dirs::data_dir().ok_or(StorageError::NoDataDir)?;
        Ok(Self {
            root: base.join(app_name).join("saves"),
        })
    }

    /// The save root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The save file for one capsule.
    pub fn capsule_file(&self, id: &CapsuleId) -> PathBuf {
        self.root.join(format!("{}.{FILE_EXTENSION}", id.as_str()))
    }

    /// The root's lock file.
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Create the save root if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Propagates the underlying directory creation failure.
    pub fn ensure_root(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.root).map_err(|source| StorageError::Io {
            path: self.root.clone(),
            source,
        })
    }
}
