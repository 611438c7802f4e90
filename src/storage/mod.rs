//! storage
//!
//! The orchestrator tying object graphs to capsule files.
//!
//! # Architecture
//!
//! [`Storage`] manages a set of capsules (root objects, one save file
//! each) over one save root directory. Between disk operations it holds a
//! cache: per capsule, one [`AttributeStore`] cell per reference identity.
//! The cache is the unit of consistency. A save pass rebuilds it from the
//! live objects; a load pass rebuilds the live objects from it; flush and
//! refresh move it to and from disk wholesale. A pass that fails leaves
//! the previous cache untouched.
//!
//! # Save pass
//!
//! One [`ReferenceResolver`] spans the whole pass so an object referenced
//! from two places keeps one identity. Each capsule root is pre-bound to
//! the shared root identity, then the pass drains the resolver's discovery
//! worklist: every discovered object gets a fresh store, its type stamped
//! under reserved keys, its `save` run, and amnesty-listed keys from its
//! previously bound store copied forward. A reference that crosses capsule
//! files cannot resolve at load time, so the pass detects and rejects it.
//!
//! # Load pass
//!
//! Each capsule loads with its own resolver because identity counters
//! restart per file; sharing one would alias entries across capsules. The
//! pass drains the request worklist starting from the root identity,
//! materializing objects through the registry, then settles every
//! leftover request as not-found and runs `load_completed` on the loaded
//! objects in reverse materialization order (leaves before roots).

pub mod envelope;
pub mod lock;
pub mod paths;

pub use envelope::{Encoding, EnvelopeError, SaveEnvelope};
pub use lock::StorageLock;
pub use paths::StoragePaths;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Loader, Saver};
use crate::core::store::{AttributeStore, StoreError};
use crate::core::types::{keys, CapsuleId, ReferenceId, TypeError};
use crate::registry::{RegistryError, SaveableRegistry, TypeInfo};
use crate::resolver::ReferenceResolver;
use crate::saveable::{handle_key, Capsule, Saveable, SaveableRef};

/// Shared handle to one cached attribute store.
pub type StoreCell = Rc<RefCell<AttributeStore>>;

/// Errors from storage orchestration.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The platform exposes no per-user data directory.
    #[error("no platform data directory available")]
    NoDataDir,

    /// Another process holds the save root's lock.
    #[error("save root is locked by another process ({})", path.display())]
    AlreadyLocked { path: PathBuf },

    /// Filesystem operation failed.
    #[error("i/o failure at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A capsule with this id is already managed.
    #[error("capsule '{0}' is already managed")]
    DuplicateCapsule(CapsuleId),

    /// The named capsule is not managed by this storage.
    #[error("capsule '{0}' is not managed by this storage")]
    UnknownCapsule(CapsuleId),

    /// The named reference does not exist in the capsule's cache.
    #[error("reference '{reference}' does not exist in capsule '{capsule}'")]
    UnknownReference {
        capsule: CapsuleId,
        reference: ReferenceId,
    },

    /// A discovered object's type is not registered, so it could never be
    /// materialized again.
    #[error("type '{label}' reached from capsule '{capsule}' is not registered")]
    UnregisteredType { capsule: CapsuleId, label: String },

    /// A reference points at an object saved into a different capsule's
    /// file, where it could never resolve.
    #[error("capsule '{capsule}' references object '{label}' owned by capsule '{owner}'")]
    CrossCapsuleReference {
        capsule: CapsuleId,
        owner: CapsuleId,
        label: String,
    },

    /// Capsule id construction failed.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// Registry lookup or construction failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Attribute store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Save file could not be sealed or opened.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// One reference as seen through the read surface.
pub struct ReadReference {
    pub id: ReferenceId,
    /// Registry identity of the stored type, when it resolves.
    pub type_info: Option<TypeInfo>,
    pub store: StoreCell,
}

/// One capsule's cached state, exposed for migrations and tooling.
///
/// The cells are the live cache: edits through them are picked up by the
/// next [`Storage::flush`].
pub struct ReadResult {
    pub capsule_id: CapsuleId,
    pub root: StoreCell,
    pub references: Vec<ReadReference>,
}

impl ReadResult {
    /// Store for an identity, the root included.
    pub fn store_for(&self, id: &ReferenceId) -> Option<&StoreCell> {
        if id.is_root() {
            return Some(&self.root);
        }
        self.references
            .iter()
            .find(|r| &r.id == id)
            .map(|r| &r.store)
    }
}

type CapsuleCache = BTreeMap<ReferenceId, StoreCell>;

/// Object-graph persistence over one save root.
pub struct Storage {
    paths: StoragePaths,
    encoding: Encoding,
    registry: Rc<SaveableRegistry>,
    /// Managed capsules in registration order.
    capsules: Vec<(CapsuleId, SaveableRef)>,
    caches: HashMap<CapsuleId, CapsuleCache>,
    /// Live object -> the store it was last saved to or loaded from, for
    /// amnesty copy-forward. Keyed by allocation address with a `Weak`
    /// liveness guard.
    bindings: HashMap<usize, (Weak<RefCell<dyn Saveable>>, StoreCell)>,
}

impl Storage {
    /// Storage over the given root, with no capsules yet.
    pub fn new(paths: StoragePaths, encoding: Encoding, registry: Rc<SaveableRegistry>) -> Self {
        Self {
            paths,
            encoding,
            registry,
            capsules: Vec::new(),
            caches: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    /// The save root layout.
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// The active transport encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Managed capsule ids, in registration order.
    pub fn capsule_ids(&self) -> Vec<CapsuleId> {
        self.capsules.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Put a capsule under management and prime its cache from disk.
    ///
    /// # Errors
    ///
    /// `StorageError::DuplicateCapsule` when the id is already managed;
    /// lock or read failures from the initial refresh.
    pub fn add_capsule<C: Capsule>(&mut self, capsule: Rc<RefCell<C>>) -> Result<(), StorageError> {
        let id = capsule.borrow().capsule_id();
        if self.capsules.iter().any(|(c, _)| c == &id) {
            return Err(StorageError::DuplicateCapsule(id));
        }
        self.refresh_capsule(&id)?;
        let object: SaveableRef = capsule;
        self.capsules.push((id, object));
        Ok(())
    }

    /// Re-read capsule files into the cache, discarding unflushed state.
    /// An empty id list means every managed capsule.
    ///
    /// # Errors
    ///
    /// Unknown ids, lock contention, or unreadable files. A file that
    /// exists but fails to decode is logged and treated as empty rather
    /// than failing the refresh.
    pub fn refresh(&mut self, capsule_ids: &[CapsuleId]) -> Result<(), StorageError> {
        for (id, _) in self.selection(capsule_ids)? {
            self.refresh_capsule(&id)?;
        }
        Ok(())
    }

    /// Run a save pass over the selected capsules (empty list = all).
    ///
    /// Walks each capsule's object graph, rebuilds the capsule caches, and
    /// optionally flushes them to disk. On error the previous caches are
    /// kept.
    ///
    /// # Errors
    ///
    /// Unknown ids, an unregistered non-root type, a cross-capsule
    /// reference, or (when flushing) lock or write failures.
    pub fn save(
        &mut self,
        flush_after_save: bool,
        capsule_ids: &[CapsuleId],
    ) -> Result<(), StorageError> {
        let selected = self.selection(capsule_ids)?;
        let registry = self.registry.clone();

        let mut resolver = ReferenceResolver::new();
        for (_, object) in &selected {
            resolver.bind(object, ReferenceId::root());
        }

        // Identity -> owning capsule, for cross-capsule detection.
        let mut owners: HashMap<ReferenceId, CapsuleId> = HashMap::new();
        let mut new_caches: Vec<(CapsuleId, CapsuleCache)> = Vec::new();
        let mut new_bindings: Vec<(usize, Weak<RefCell<dyn Saveable>>, StoreCell)> = Vec::new();

        for (capsule_id, capsule_obj) in &selected {
            resolver.begin_scope(capsule_obj);
            resolver.seed(capsule_obj, ReferenceId::root());

            let mut stores: CapsuleCache = BTreeMap::new();
            let mut processed: Vec<SaveableRef> = Vec::new();

            while let Some((id, object)) = resolver.take_discovered() {
                let store =
                    self.save_one(capsule_id, &id, &object, &registry, &mut resolver)?;
                if !id.is_root() {
                    owners.insert(id.clone(), capsule_id.clone());
                }
                let cell = Rc::new(RefCell::new(store));
                new_bindings.push((handle_key(&object), Rc::downgrade(&object), cell.clone()));
                stores.insert(id, cell);
                processed.push(object);
            }

            for foreign in resolver.take_foreign_roots() {
                let label = foreign.borrow().type_label().to_string();
                let owner = self
                    .capsules
                    .iter()
                    .find(|(_, obj)| Rc::ptr_eq(obj, &foreign))
                    .map(|(id, _)| id.clone())
                    .unwrap_or_else(|| capsule_id.clone());
                return Err(StorageError::CrossCapsuleReference {
                    capsule: capsule_id.clone(),
                    owner,
                    label,
                });
            }

            for object in processed.iter().rev() {
                object.borrow_mut().load_completed();
            }

            debug!(capsule = %capsule_id, references = stores.len(), "capsule graph saved");
            new_caches.push((capsule_id.clone(), stores));
        }

        self.check_ownership(&new_caches, &owners)?;

        for (capsule_id, stores) in new_caches {
            self.caches.insert(capsule_id, stores);
        }
        for (key, weak, cell) in new_bindings {
            self.bindings.insert(key, (weak, cell));
        }
        self.bindings.retain(|_, (weak, _)| weak.upgrade().is_some());

        info!(capsules = selected.len(), flush = flush_after_save, "save pass complete");
        if flush_after_save {
            self.flush(capsule_ids)?;
        }
        Ok(())
    }

    /// Run a load pass over the selected capsules (empty list = all),
    /// re-reading each capsule file and rebuilding live object state from
    /// it. Unflushed cache state is discarded.
    ///
    /// Dangling references and unregistered stored types are logged and
    /// settle as not-found; they never fail the pass.
    ///
    /// # Errors
    ///
    /// Unknown capsule ids, lock contention, or unreadable files.
    pub fn load(&mut self, capsule_ids: &[CapsuleId]) -> Result<(), StorageError> {
        let selected = self.selection(capsule_ids)?;
        let registry = self.registry.clone();

        for (capsule_id, capsule_obj) in &selected {
            self.refresh_capsule(capsule_id)?;
            let cache = self.caches.get(capsule_id).cloned().unwrap_or_default();
            let mut resolver = ReferenceResolver::new();
            resolver.enqueue_request(ReferenceId::root());

            let mut loaded: Vec<SaveableRef> = Vec::new();
            let mut new_bindings: Vec<(usize, Weak<RefCell<dyn Saveable>>, StoreCell)> =
                Vec::new();

            while let Some(id) = resolver.take_requested() {
                let Some(cell) = cache.get(&id) else {
                    warn!(capsule = %capsule_id, reference = %id, "dangling reference; no stored data");
                    continue;
                };
                let object = if id.is_root() {
                    capsule_obj.clone()
                } else {
                    match self.materialize(capsule_id, &id, cell, &registry) {
                        Some(object) => object,
                        None => continue,
                    }
                };
                {
                    let store = cell.borrow();
                    let mut loader = Loader::new(&store, &mut resolver);
                    object.borrow_mut().load(&mut loader);
                }
                resolver.mark_ready(&object, &id);
                new_bindings.push((handle_key(&object), Rc::downgrade(&object), cell.clone()));
                loaded.push(object);
            }

            resolver.drain_unresolved();
            for object in loaded.iter().rev() {
                object.borrow_mut().load_completed();
            }
            for (key, weak, cell) in new_bindings {
                self.bindings.insert(key, (weak, cell));
            }
            debug!(capsule = %capsule_id, references = loaded.len(), "capsule graph loaded");
        }

        info!(capsules = selected.len(), "load pass complete");
        Ok(())
    }

    /// Write the selected capsule caches to disk (empty list = all).
    ///
    /// Files are written via a temp-and-rename so readers never observe a
    /// partial file. The save root lock is held for the duration.
    ///
    /// # Errors
    ///
    /// Unknown ids, lock contention, or a filesystem failure.
    pub fn flush(&mut self, capsule_ids: &[CapsuleId]) -> Result<(), StorageError> {
        let selected = self.selection(capsule_ids)?;
        self.paths.ensure_root()?;
        let _lock = StorageLock::acquire(self.paths.lock_file())?;

        for (capsule_id, _) in &selected {
            let cache = self.caches.get(capsule_id).cloned().unwrap_or_default();
            let stores: BTreeMap<ReferenceId, AttributeStore> = cache
                .iter()
                .map(|(id, cell)| (id.clone(), cell.borrow().clone()))
                .collect();
            let sealed = envelope::seal(&SaveEnvelope::build(capsule_id, &stores), self.encoding)?;
            let path = self.paths.capsule_file(capsule_id);
            write_atomic(&path, &sealed)?;
            debug!(capsule = %capsule_id, path = %path.display(), "capsule flushed");
        }
        Ok(())
    }

    /// Drop the selected capsule caches (empty list = all).
    ///
    /// With `remove_files` the capsule files are deleted and the save root
    /// pruned when it ends up empty; without it, empty capsules are
    /// flushed so disk and cache agree. A missing save root is left
    /// missing either way.
    ///
    /// # Errors
    ///
    /// Unknown ids, lock contention, or a filesystem failure.
    pub fn clear(
        &mut self,
        remove_files: bool,
        capsule_ids: &[CapsuleId],
    ) -> Result<(), StorageError> {
        let selected = self.selection(capsule_ids)?;
        for (capsule_id, _) in &selected {
            self.caches.insert(capsule_id.clone(), BTreeMap::new());
        }
        let cleared: Vec<_> = selected.iter().map(|(id, _)| id.clone()).collect();
        self.bindings
            .retain(|_, (_, cell)| !cleared.contains(cell.borrow().capsule_id()));

        if !remove_files {
            // Nothing on disk means nothing to rewrite.
            if !self.paths.root().is_dir() {
                return Ok(());
            }
            return self.flush(capsule_ids);
        }

        if self.paths.root().is_dir() {
            let _lock = StorageLock::acquire(self.paths.lock_file())?;
            for (capsule_id, _) in &selected {
                let path = self.paths.capsule_file(capsule_id);
                match std::fs::remove_file(&path) {
                    Ok(()) => info!(capsule = %capsule_id, "capsule file removed"),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => return Err(StorageError::Io { path, source }),
                }
            }
        }
        prune_empty_root(&self.paths);
        Ok(())
    }

    /// Read surface over the selected capsules (empty list = all),
    /// refreshed from disk first. A capsule with no root store yet gets an
    /// empty one so edits have somewhere to land.
    ///
    /// # Errors
    ///
    /// Unknown capsule ids, lock contention, or unreadable files.
    pub fn read(&mut self, capsule_ids: &[CapsuleId]) -> Result<Vec<ReadResult>, StorageError> {
        self.selection(capsule_ids)?
            .into_iter()
            .map(|(id, _)| self.read_capsule(&id))
            .collect()
    }

    /// Read surface over one capsule. See [`Self::read`].
    ///
    /// # Errors
    ///
    /// `StorageError::UnknownCapsule`, lock contention, or an unreadable
    /// file.
    pub fn read_capsule(&mut self, capsule_id: &CapsuleId) -> Result<ReadResult, StorageError> {
        if !self.capsules.iter().any(|(id, _)| id == capsule_id) {
            return Err(StorageError::UnknownCapsule(capsule_id.clone()));
        }
        self.refresh_capsule(capsule_id)?;
        let cache = self.caches.entry(capsule_id.clone()).or_default();
        let root = cache
            .entry(ReferenceId::root())
            .or_insert_with(|| Rc::new(RefCell::new(AttributeStore::new(capsule_id.clone()))))
            .clone();

        let references = cache
            .iter()
            .filter(|(id, _)| !id.is_root())
            .map(|(id, cell)| ReadReference {
                id: id.clone(),
                type_info: stored_type_info(&cell.borrow(), &self.registry),
                store: cell.clone(),
            })
            .collect();

        Ok(ReadResult {
            capsule_id: capsule_id.clone(),
            root,
            references,
        })
    }

    /// Editable handle to one cached store.
    ///
    /// # Errors
    ///
    /// `StorageError::UnknownCapsule` or `StorageError::UnknownReference`.
    pub fn editable_ref(
        &mut self,
        capsule_id: &CapsuleId,
        reference_id: &ReferenceId,
    ) -> Result<StoreCell, StorageError> {
        if reference_id.is_root() {
            return Ok(self.read_capsule(capsule_id)?.root);
        }
        self.caches
            .get(capsule_id)
            .and_then(|cache| cache.get(reference_id))
            .cloned()
            .ok_or_else(|| StorageError::UnknownReference {
                capsule: capsule_id.clone(),
                reference: reference_id.clone(),
            })
    }

    /// Mint a new reference entry in a capsule's cache, with an identity
    /// no save pass will ever allocate.
    ///
    /// # Errors
    ///
    /// `StorageError::UnknownCapsule`.
    pub fn register_new_ref(
        &mut self,
        capsule_id: &CapsuleId,
    ) -> Result<(ReferenceId, StoreCell), StorageError> {
        if !self.capsules.iter().any(|(id, _)| id == capsule_id) {
            return Err(StorageError::UnknownCapsule(capsule_id.clone()));
        }
        let id = ReferenceId::parse(Uuid::new_v4().to_string())?;
        let cell = Rc::new(RefCell::new(AttributeStore::new(capsule_id.clone())));
        self.caches
            .entry(capsule_id.clone())
            .or_default()
            .insert(id.clone(), cell.clone());
        Ok((id, cell))
    }

    // ---- internals ---------------------------------------------------------

    fn selection(
        &self,
        capsule_ids: &[CapsuleId],
    ) -> Result<Vec<(CapsuleId, SaveableRef)>, StorageError> {
        if capsule_ids.is_empty() {
            return Ok(self.capsules.clone());
        }
        capsule_ids
            .iter()
            .map(|id| {
                self.capsules
                    .iter()
                    .find(|(c, _)| c == id)
                    .cloned()
                    .ok_or_else(|| StorageError::UnknownCapsule(id.clone()))
            })
            .collect()
    }

    fn refresh_capsule(&mut self, capsule_id: &CapsuleId) -> Result<(), StorageError> {
        let path = self.paths.capsule_file(capsule_id);
        let stores = if path.is_file() {
            let _lock = StorageLock::acquire(self.paths.lock_file())?;
            let text = std::fs::read_to_string(&path).map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
            match envelope::open(&text, self.encoding) {
                Ok(envelope) => envelope
                    .into_stores(capsule_id)
                    .into_iter()
                    .map(|(id, store)| (id, Rc::new(RefCell::new(store)) as StoreCell))
                    .collect(),
                Err(err) => {
                    warn!(
                        capsule = %capsule_id,
                        path = %path.display(),
                        error = %err,
                        "unreadable save file; starting from an empty capsule"
                    );
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        // Re-point object bindings at the refreshed cells, so the next
        // save pass copies amnesty values forward from on-disk state, not
        // from whatever the discarded cache held. Bindings whose identity
        // vanished from disk are dropped.
        if let Some(previous) = self.caches.get(capsule_id) {
            let ids_by_cell: HashMap<*const RefCell<AttributeStore>, &ReferenceId> =
                previous.iter().map(|(id, cell)| (Rc::as_ptr(cell), id)).collect();
            self.bindings.retain(|_, (_, cell)| {
                match ids_by_cell.get(&Rc::as_ptr(cell)) {
                    Some(&id) => match stores.get(id) {
                        Some(refreshed) => {
                            *cell = refreshed.clone();
                            true
                        }
                        None => false,
                    },
                    None => true,
                }
            });
        }

        self.caches.insert(capsule_id.clone(), stores);
        Ok(())
    }

    /// Build one discovered object's store: type stamp, `save`, amnesty
    /// copy-forward.
    fn save_one(
        &self,
        capsule_id: &CapsuleId,
        id: &ReferenceId,
        object: &SaveableRef,
        registry: &SaveableRegistry,
        resolver: &mut ReferenceResolver,
    ) -> Result<AttributeStore, StorageError> {
        let mut store = AttributeStore::new(capsule_id.clone());

        let type_id = object.borrow().as_any().type_id();
        match registry.entry_for_type(type_id) {
            Some(info) => {
                store.write(keys::REFERENCE_TYPE_ID, &info.id)?;
                store.write(keys::REFERENCE_TYPE_NAME, &info.name)?;
            }
            // Capsules are materialized by the caller, not the registry, so
            // an unregistered root only costs the numeric type key.
            None if id.is_root() => {
                let label = object.borrow().type_label().to_string();
                store.write(keys::REFERENCE_TYPE_NAME, &label)?;
            }
            None => {
                return Err(StorageError::UnregisteredType {
                    capsule: capsule_id.clone(),
                    label: object.borrow().type_label().to_string(),
                });
            }
        }

        {
            let guard = object.borrow();
            let mut saver = Saver::new(&mut store, resolver);
            guard.save(&mut saver);
        }

        if let Some((weak, previous)) = self.bindings.get(&handle_key(object)) {
            if weak.upgrade().is_some() {
                let previous = previous.borrow();
                for key in previous.value_keys() {
                    if previous.should_keep(key) && !store.has_value(key) {
                        if let Some(section) = previous.section(key) {
                            store.set_section(key, section.clone())?;
                        }
                    }
                }
            }
        }

        Ok(store)
    }

    fn materialize(
        &self,
        capsule_id: &CapsuleId,
        id: &ReferenceId,
        cell: &StoreCell,
        registry: &SaveableRegistry,
    ) -> Option<SaveableRef> {
        let store = cell.borrow();
        let created = match store.get::<u64>(keys::REFERENCE_TYPE_ID).ok().flatten() {
            Some(type_id) => registry.create(type_id),
            None => match store.get::<String>(keys::REFERENCE_TYPE_NAME).ok().flatten() {
                Some(name) => registry.create_by_name(&name),
                None => {
                    warn!(capsule = %capsule_id, reference = %id, "stored reference has no type; skipping");
                    return None;
                }
            },
        };
        match created {
            Ok(object) => Some(object),
            Err(err) => {
                warn!(
                    capsule = %capsule_id,
                    reference = %id,
                    error = %err,
                    "cannot materialize stored reference; skipping"
                );
                None
            }
        }
    }

    fn check_ownership(
        &self,
        new_caches: &[(CapsuleId, CapsuleCache)],
        owners: &HashMap<ReferenceId, CapsuleId>,
    ) -> Result<(), StorageError> {
        for (capsule_id, stores) in new_caches {
            for cell in stores.values() {
                let store = cell.borrow();
                let ref_keys: Vec<String> =
                    store.reference_keys().map(str::to_string).collect();
                for key in ref_keys {
                    for id in store.reference_ids(&key) {
                        if id.is_root() {
                            continue;
                        }
                        if let Some(owner) = owners.get(&id) {
                            if owner != capsule_id {
                                return Err(StorageError::CrossCapsuleReference {
                                    capsule: capsule_id.clone(),
                                    owner: owner.clone(),
                                    label: format!("reference '{key}' = {id}"),
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn stored_type_info(store: &AttributeStore, registry: &SaveableRegistry) -> Option<TypeInfo> {
    if let Some(type_id) = store.get::<u64>(keys::REFERENCE_TYPE_ID).ok().flatten() {
        if let Some(info) = registry.info_for_id(type_id) {
            return Some(info.clone());
        }
    }
    store
        .get::<String>(keys::REFERENCE_TYPE_NAME)
        .ok()
        .flatten()
        .and_then(|name| registry.info_for_name(&name).cloned())
}

fn write_atomic(path: &Path, text: &str) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, text).map_err(|source| StorageError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Remove the save root directory when nothing is left in it but the lock
/// file. Failures here are cosmetic and ignored.
fn prune_empty_root(paths: &StoragePaths) {
    let root = paths.root();
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    let lock = paths.lock_file();
    for entry in entries.flatten() {
        if entry.path() != lock {
            return;
        }
    }
    let _ = std::fs::remove_file(&lock);
    let _ = std::fs::remove_dir(root);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saveable::saveable;
    use std::any::Any;

    #[derive(Default)]
    struct Counter {
        hits: i32,
    }

    impl Saveable for Counter {
        fn save(&self, saver: &mut Saver<'_>) {
            saver.value("hits", &self.hits);
        }
        fn load(&mut self, loader: &mut Loader<'_>) {
            self.hits = loader.value("hits").unwrap_or_default();
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl Capsule for Counter {
        fn capsule_id(&self) -> CapsuleId {
            CapsuleId::new("counter").unwrap()
        }
    }

    fn storage(dir: &Path) -> Storage {
        Storage::new(
            StoragePaths::new(dir),
            Encoding::None,
            Rc::new(SaveableRegistry::new()),
        )
    }

    #[test]
    fn load_reads_on_disk_state_not_the_unflushed_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage(dir.path());
        let counter = saveable(Counter { hits: 7 });
        storage.add_capsule(counter.clone()).unwrap();
        storage.save(true, &[]).unwrap();

        // An unflushed save must not leak into the next load.
        counter.borrow_mut().hits = 3;
        storage.save(false, &[]).unwrap();
        storage.load(&[]).unwrap();
        assert_eq!(counter.borrow().hits, 7);
    }

    #[test]
    fn flush_and_refresh_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage(dir.path());
        let counter = saveable(Counter { hits: 3 });
        storage.add_capsule(counter.clone()).unwrap();

        storage.save(true, &[]).unwrap();
        assert!(dir.path().join("counter.ksf").is_file());

        counter.borrow_mut().hits = 0;
        storage.refresh(&[]).unwrap();
        storage.load(&[]).unwrap();
        assert_eq!(counter.borrow().hits, 3);
    }

    #[test]
    fn corrupt_file_loads_as_empty_capsule() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("counter.ksf"), "{ not json").unwrap();

        let mut storage = storage(dir.path());
        let counter = saveable(Counter { hits: 9 });
        storage.add_capsule(counter.clone()).unwrap();
        storage.load(&[]).unwrap();
        // No stored root, so load leaves the object untouched.
        assert_eq!(counter.borrow().hits, 9);
    }

    #[test]
    fn duplicate_capsule_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage(dir.path());
        storage.add_capsule(saveable(Counter::default())).unwrap();
        assert!(matches!(
            storage.add_capsule(saveable(Counter::default())),
            Err(StorageError::DuplicateCapsule(_))
        ));
    }

    #[test]
    fn unknown_capsule_selection_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage(dir.path());
        let ghost = CapsuleId::new("ghost").unwrap();
        assert!(matches!(
            storage.save(false, &[ghost]),
            Err(StorageError::UnknownCapsule(_))
        ));
    }

    #[test]
    fn amnesty_value_survives_a_save_that_does_not_rewrite_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage(dir.path());
        let counter = saveable(Counter { hits: 1 });
        storage.add_capsule(counter.clone()).unwrap();
        storage.save(true, &[]).unwrap();

        let capsule_id = CapsuleId::new("counter").unwrap();
        let root = storage.editable_ref(&capsule_id, &ReferenceId::root()).unwrap();
        root.borrow_mut().set_value("injected", &42i64).unwrap();
        storage.flush(&[]).unwrap();

        storage.save(true, &[]).unwrap();
        let root = storage.editable_ref(&capsule_id, &ReferenceId::root()).unwrap();
        assert_eq!(root.borrow().get::<i64>("injected").unwrap(), Some(42));
        // The object's own key was rewritten, not copied forward.
        assert_eq!(root.borrow().get::<i32>("hits").unwrap(), Some(1));
    }

    #[test]
    fn clear_with_remove_files_prunes_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let saves = dir.path().join("saves");
        let mut storage = storage(&saves);
        storage.add_capsule(saveable(Counter { hits: 2 })).unwrap();
        storage.save(true, &[]).unwrap();
        assert!(saves.join("counter.ksf").is_file());

        storage.clear(true, &[]).unwrap();
        assert!(!saves.exists());
        let result = storage.read(&[]).unwrap();
        assert!(result[0].references.is_empty());
        assert!(!result[0].root.borrow().has_value("hits"));
    }

    #[test]
    fn clear_without_remove_files_flushes_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage(dir.path());
        let counter = saveable(Counter { hits: 5 });
        storage.add_capsule(counter).unwrap();
        storage.save(true, &[]).unwrap();

        storage.clear(false, &[]).unwrap();
        let path = dir.path().join("counter.ksf");
        assert!(path.is_file());

        storage.refresh(&[]).unwrap();
        let result = storage.read(&[]).unwrap();
        assert!(!result[0].root.borrow().has_value("hits"));
    }

    #[test]
    fn clear_without_a_save_root_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let saves = dir.path().join("saves");
        let mut storage = storage(&saves);
        storage.add_capsule(saveable(Counter { hits: 4 })).unwrap();

        storage.clear(false, &[]).unwrap();
        assert!(!saves.exists());
    }

    #[test]
    fn register_new_ref_mints_a_non_counter_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage(dir.path());
        storage.add_capsule(saveable(Counter::default())).unwrap();

        let capsule_id = CapsuleId::new("counter").unwrap();
        let (id, cell) = storage.register_new_ref(&capsule_id).unwrap();
        assert!(id.as_str().parse::<u64>().is_err());
        cell.borrow_mut().set_value("seed", &true).unwrap();
        assert!(storage
            .editable_ref(&capsule_id, &id)
            .unwrap()
            .borrow()
            .has_value("seed"));
    }
}
