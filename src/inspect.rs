//! inspect
//!
//! Offline examination of save files: validation, description, and
//! file-level clearing. Everything here works directly on files through
//! the envelope layer, so no capsule objects or registrations are needed
//! beyond what the caller can supply.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use tracing::debug;

use crate::core::store::AttributeStore;
use crate::core::types::{keys, CapsuleId, ReferenceId};
use crate::registry::SaveableRegistry;
use crate::storage::envelope::{self, Encoding, SaveEnvelope};
use crate::storage::paths::{StoragePaths, FILE_EXTENSION};
use crate::storage::{StorageError, StorageLock};

/// How bad a finding is. Ordered so the worst can be folded out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Nothing wrong.
    None,
    /// Data survives loading but something will be dropped or ignored.
    Warning,
    /// Data cannot be loaded as stored.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::None => f.write_str("ok"),
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// One problem found in a save root.
#[derive(Debug)]
pub struct Finding {
    pub capsule: CapsuleId,
    pub reference: Option<ReferenceId>,
    pub key: Option<String>,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.capsule)?;
        if let Some(reference) = &self.reference {
            write!(f, " ref {reference}")?;
        }
        if let Some(key) = &self.key {
            write!(f, " key '{key}'")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Everything validation had to say about a save root.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    /// Worst severity across all findings.
    pub fn worst(&self) -> Severity {
        self.findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::None)
    }

    /// Whether nothing was found at all.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    fn push(
        &mut self,
        capsule: &CapsuleId,
        reference: Option<&ReferenceId>,
        key: Option<&str>,
        severity: Severity,
        message: impl Into<String>,
    ) {
        self.findings.push(Finding {
            capsule: capsule.clone(),
            reference: reference.cloned(),
            key: key.map(str::to_string),
            severity,
            message: message.into(),
        });
    }
}

/// Capsule save files present under a save root, by id.
///
/// Files whose stem is not a usable capsule id are skipped.
///
/// # Errors
///
/// Directory listing failure; a missing root lists as empty.
pub fn list_capsules(paths: &StoragePaths) -> Result<Vec<CapsuleId>, StorageError> {
    let root = paths.root();
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(root).map_err(|source| StorageError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    let mut ids = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match CapsuleId::new(stem) {
            Ok(id) => ids.push(id),
            Err(err) => debug!(path = %path.display(), error = %err, "skipping non-capsule file"),
        }
    }
    ids.sort();
    Ok(ids)
}

/// Validate every capsule file under a save root.
///
/// With an empty `registry`, stored types downgrade to warnings instead
/// of resolving; structural problems are reported the same either way.
///
/// # Errors
///
/// Directory or file read failure. Decode problems become findings, not
/// errors.
pub fn validate(
    paths: &StoragePaths,
    encoding: Encoding,
    registry: &SaveableRegistry,
) -> Result<ValidationReport, StorageError> {
    let mut report = ValidationReport::default();
    for capsule_id in list_capsules(paths)? {
        match read_envelope(paths, encoding, &capsule_id)? {
            Ok(stores) => validate_capsule(&capsule_id, &stores, registry, &mut report),
            Err(err) => report.push(
                &capsule_id,
                None,
                None,
                Severity::Error,
                format!("file cannot be decoded: {err}"),
            ),
        }
    }
    Ok(report)
}

fn validate_capsule(
    capsule_id: &CapsuleId,
    stores: &BTreeMap<ReferenceId, AttributeStore>,
    registry: &SaveableRegistry,
    report: &mut ValidationReport,
) {
    if !stores.contains_key(&ReferenceId::root()) && !stores.is_empty() {
        report.push(
            capsule_id,
            None,
            None,
            Severity::Error,
            "no root entry; nothing can be loaded from this file",
        );
    }

    for (id, store) in stores {
        if !id.is_root() {
            check_stored_type(capsule_id, id, store, registry, report);
        }

        for key in store.value_keys() {
            let Some(section) = store.section(key) else {
                continue;
            };
            if !section.is_valid() {
                report.push(
                    capsule_id,
                    Some(id),
                    Some(key),
                    Severity::Warning,
                    "value section has no type tag",
                );
            } else if let Err(err) = section.decode_dyn() {
                report.push(
                    capsule_id,
                    Some(id),
                    Some(key),
                    Severity::Warning,
                    format!("unreadable value: {err}"),
                );
            }
        }

        for key in store.reference_keys() {
            for target in store.reference_ids(key) {
                if !stores.contains_key(&target) {
                    report.push(
                        capsule_id,
                        Some(id),
                        Some(key),
                        Severity::Warning,
                        format!("dangling reference to '{target}'"),
                    );
                }
            }
        }
    }
}

fn check_stored_type(
    capsule_id: &CapsuleId,
    id: &ReferenceId,
    store: &AttributeStore,
    registry: &SaveableRegistry,
    report: &mut ValidationReport,
) {
    let by_id = store.get::<u64>(keys::REFERENCE_TYPE_ID).ok().flatten();
    let by_name = store.get::<String>(keys::REFERENCE_TYPE_NAME).ok().flatten();
    match (by_id, by_name) {
        (None, None) => report.push(
            capsule_id,
            Some(id),
            None,
            Severity::Error,
            "entry carries no type; it can never be materialized",
        ),
        (id_key, name_key) => {
            let resolves = id_key.is_some_and(|t| registry.info_for_id(t).is_some())
                || name_key
                    .as_deref()
                    .is_some_and(|n| registry.info_for_name(n).is_some());
            if !resolves {
                report.push(
                    capsule_id,
                    Some(id),
                    None,
                    Severity::Warning,
                    "stored type is not registered here",
                );
            }
        }
    }
}

/// Human-readable description of one capsule file.
///
/// # Errors
///
/// Missing or unreadable file, or a file that fails to decode.
pub fn describe(
    paths: &StoragePaths,
    encoding: Encoding,
    capsule_id: &CapsuleId,
) -> Result<String, StorageError> {
    let stores = read_envelope(paths, encoding, capsule_id)??;

    let mut out = String::new();
    use fmt::Write;
    let _ = writeln!(out, "capsule '{capsule_id}' ({} references)", stores.len());
    for (id, store) in &stores {
        let _ = writeln!(out, "  [{id}]");
        for key in store.value_keys() {
            if keys::is_reserved(key) {
                continue;
            }
            let rendered = store
                .section(key)
                .and_then(|s| s.decode_dyn().ok())
                .map(|v| v.to_string())
                .unwrap_or_else(|| "<unreadable>".to_string());
            let _ = writeln!(out, "    {key} = {rendered}");
        }
        for key in store.reference_keys() {
            let _ = writeln!(out, "    {key} -> {}", store.reference_raw(key).unwrap_or(""));
        }
    }
    Ok(out)
}

/// Clear capsule files in place, without managing any capsule objects.
///
/// An empty `capsule_ids` means every capsule file under the root. With
/// `remove_files` the files are deleted; otherwise each is rewritten as
/// an empty capsule.
///
/// # Errors
///
/// Lock contention or a filesystem failure.
pub fn clear(
    paths: &StoragePaths,
    encoding: Encoding,
    capsule_ids: &[CapsuleId],
    remove_files: bool,
) -> Result<(), StorageError> {
    let targets = if capsule_ids.is_empty() {
        list_capsules(paths)?
    } else {
        capsule_ids.to_vec()
    };
    if targets.is_empty() {
        return Ok(());
    }
    if !paths.root().is_dir() {
        if remove_files {
            return Ok(());
        }
        paths.ensure_root()?;
    }

    let _lock = StorageLock::acquire(paths.lock_file())?;
    for capsule_id in &targets {
        let path = paths.capsule_file(capsule_id);
        if remove_files {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StorageError::Io { path, source }),
            }
        } else {
            let empty = SaveEnvelope::build(capsule_id, &BTreeMap::new());
            let sealed = envelope::seal(&empty, encoding)?;
            std::fs::write(&path, sealed).map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Read and decode one capsule file. The outer error is i/o, the inner
/// one a decode failure the caller may want to downgrade.
fn read_envelope(
    paths: &StoragePaths,
    encoding: Encoding,
    capsule_id: &CapsuleId,
) -> Result<Result<BTreeMap<ReferenceId, AttributeStore>, StorageError>, StorageError> {
    let path = paths.capsule_file(capsule_id);
    let text = std::fs::read_to_string(&path).map_err(|source| StorageError::Io {
        path: path.clone(),
        source,
    })?;
    match envelope::open(&text, encoding) {
        Ok(envelope) => Ok(Ok(envelope.into_stores(capsule_id))),
        Err(err) => Ok(Err(StorageError::Envelope(err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ReferenceId;
    use std::path::Path;

    fn write_capsule(
        dir: &Path,
        capsule: &str,
        stores: &BTreeMap<ReferenceId, AttributeStore>,
    ) -> StoragePaths {
        let paths = StoragePaths::new(dir);
        let id = CapsuleId::new(capsule).unwrap();
        let sealed = envelope::seal(&SaveEnvelope::build(&id, stores), Encoding::None).unwrap();
        std::fs::write(paths.capsule_file(&id), sealed).unwrap();
        paths
    }

    fn healthy_stores(capsule: &str) -> BTreeMap<ReferenceId, AttributeStore> {
        let id = CapsuleId::new(capsule).unwrap();
        let mut root = AttributeStore::new(id.clone());
        root.write("level", &3i32).unwrap();
        root.set_reference("pet", &ReferenceId::from_counter(0));

        let mut pet = AttributeStore::new(id);
        pet.write(keys::REFERENCE_TYPE_NAME, &"game::Pet".to_string())
            .unwrap();

        let mut stores = BTreeMap::new();
        stores.insert(ReferenceId::root(), root);
        stores.insert(ReferenceId::from_counter(0), pet);
        stores
    }

    #[test]
    fn healthy_root_reports_only_unregistered_type() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_capsule(dir.path(), "player", &healthy_stores("player"));

        let report = validate(&paths, Encoding::None, &SaveableRegistry::new()).unwrap();
        assert_eq!(report.worst(), Severity::Warning);
        assert_eq!(report.findings.len(), 1);
        assert!(report.findings[0].message.contains("not registered"));
    }

    #[test]
    fn dangling_reference_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut stores = healthy_stores("player");
        stores
            .get_mut(&ReferenceId::root())
            .unwrap()
            .set_reference("ghost", &ReferenceId::from_counter(42));
        let paths = write_capsule(dir.path(), "player", &stores);

        let report = validate(&paths, Encoding::None, &SaveableRegistry::new()).unwrap();
        assert!(report
            .findings
            .iter()
            .any(|f| f.severity == Severity::Warning && f.message.contains("dangling")));
    }

    #[test]
    fn typeless_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut stores = healthy_stores("player");
        let id = CapsuleId::new("player").unwrap();
        stores.insert(ReferenceId::from_counter(1), AttributeStore::new(id));
        let paths = write_capsule(dir.path(), "player", &stores);

        let report = validate(&paths, Encoding::None, &SaveableRegistry::new()).unwrap();
        assert_eq!(report.worst(), Severity::Error);
    }

    #[test]
    fn undecodable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(dir.path());
        std::fs::write(dir.path().join("broken.ksf"), "not a save file").unwrap();

        let report = validate(&paths, Encoding::None, &SaveableRegistry::new()).unwrap();
        assert_eq!(report.worst(), Severity::Error);
        assert!(report.findings[0].message.contains("decoded"));
    }

    #[test]
    fn empty_root_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(dir.path().join("missing"));
        let report = validate(&paths, Encoding::None, &SaveableRegistry::new()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.worst(), Severity::None);
    }

    #[test]
    fn describe_renders_values_and_references() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_capsule(dir.path(), "player", &healthy_stores("player"));
        let text = describe(&paths, Encoding::None, &CapsuleId::new("player").unwrap()).unwrap();
        assert!(text.contains("capsule 'player'"));
        assert!(text.contains("level = 3"));
        assert!(text.contains("pet -> 0"));
    }

    #[test]
    fn clear_rewrites_or_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_capsule(dir.path(), "player", &healthy_stores("player"));
        let id = CapsuleId::new("player").unwrap();

        clear(&paths, Encoding::None, &[], false).unwrap();
        let stores = read_envelope(&paths, Encoding::None, &id).unwrap().unwrap();
        assert!(stores.is_empty());

        clear(&paths, Encoding::None, &[id.clone()], true).unwrap();
        assert!(!paths.capsule_file(&id).exists());
    }
}
