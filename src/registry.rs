//! registry
//!
//! The type factory: a pre-built bidirectional registry between saveable
//! types and their small integer identifiers.
//!
//! # Design
//!
//! Loading a reference store needs to turn a persisted type identifier back
//! into a live object. The registry is that mapping, built explicitly at
//! startup; there is no reflection or dynamic loading anywhere in the
//! engine. It answers three questions:
//!
//! - id → construct a fresh instance (`create`)
//! - id / name → type info (`info_for_id`, `info_for_name`)
//! - live object's `TypeId` → id and persisted name (`entry_for_type`)
//!
//! The persisted name is the registered string, not Rust's `type_name`,
//! so refactors do not silently change the on-disk format.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = SaveableRegistry::new();
//! registry.register::<Inventory>(1, "mygame::Inventory")?;
//! registry.register_with(2, "mygame::Boss", || saveable(Boss::hidden()))?;
//! let registry = Rc::new(registry);
//! ```

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::saveable::{Saveable, SaveableRef};

/// Errors from registry construction and lookup.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Numeric id registered twice.
    #[error("type id {0} is already registered")]
    DuplicateId(u64),

    /// Persisted name registered twice.
    #[error("type name '{0}' is already registered")]
    DuplicateName(String),

    /// One Rust type registered under two ids.
    #[error("type '{0}' is already registered")]
    DuplicateType(String),

    /// Lookup by numeric id failed.
    #[error("no saveable type registered for id {0}")]
    UnknownId(u64),

    /// Lookup by persisted name failed.
    #[error("no saveable type registered for name '{0}'")]
    UnknownName(String),
}

/// Identity of one registered saveable type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Small integer identifier, the preferred persisted form.
    pub id: u64,
    /// Qualified name, the legacy persisted form.
    pub name: String,
}

struct RegistryEntry {
    info: TypeInfo,
    type_id: TypeId,
    factory: Box<dyn Fn() -> SaveableRef>,
}

/// Bidirectional saveable type registry.
#[derive(Default)]
pub struct SaveableRegistry {
    entries: Vec<RegistryEntry>,
    by_id: HashMap<u64, usize>,
    by_name: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl SaveableRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type constructible through `Default`.
    ///
    /// # Errors
    ///
    /// Duplicate id, name, or type.
    pub fn register<T: Saveable + Default>(
        &mut self,
        id: u64,
        name: &str,
    ) -> Result<(), RegistryError> {
        self.register_with::<T, _>(id, name, || Rc::new(RefCell::new(T::default())))
    }

    /// Register a type with an explicit factory, for types whose
    /// load-ready blank state is not `Default`.
    ///
    /// # Errors
    ///
    /// Duplicate id, name, or type.
    pub fn register_with<T, F>(&mut self, id: u64, name: &str, factory: F) -> Result<(), RegistryError>
    where
        T: Saveable,
        F: Fn() -> Rc<RefCell<T>> + 'static,
    {
        if self.by_id.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        if self.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        let type_id = TypeId::of::<T>();
        if self.by_type.contains_key(&type_id) {
            return Err(RegistryError::DuplicateType(name.to_string()));
        }

        let index = self.entries.len();
        self.entries.push(RegistryEntry {
            info: TypeInfo {
                id,
                name: name.to_string(),
            },
            type_id,
            factory: Box::new(move || {
                let handle: SaveableRef = factory();
                handle
            }),
        });
        self.by_id.insert(id, index);
        self.by_name.insert(name.to_string(), index);
        self.by_type.insert(type_id, index);
        Ok(())
    }

    /// Construct a fresh instance for a persisted type id.
    ///
    /// # Errors
    ///
    /// `RegistryError::UnknownId` when nothing is registered under `id`.
    pub fn create(&self, id: u64) -> Result<SaveableRef, RegistryError> {
        let index = *self.by_id.get(&id).ok_or(RegistryError::UnknownId(id))?;
        Ok((self.entries[index].factory)())
    }

    /// Construct a fresh instance for a persisted type name (legacy files).
    ///
    /// # Errors
    ///
    /// `RegistryError::UnknownName` when nothing is registered under `name`.
    pub fn create_by_name(&self, name: &str) -> Result<SaveableRef, RegistryError> {
        let index = *self
            .by_name
            .get(name)
            .ok_or_else(|| RegistryError::UnknownName(name.to_string()))?;
        Ok((self.entries[index].factory)())
    }

    /// Type info for a persisted id.
    pub fn info_for_id(&self, id: u64) -> Option<&TypeInfo> {
        self.by_id.get(&id).map(|&i| &self.entries[i].info)
    }

    /// Type info for a persisted name.
    pub fn info_for_name(&self, name: &str) -> Option<&TypeInfo> {
        self.by_name.get(name).map(|&i| &self.entries[i].info)
    }

    /// Type info for a live object's `TypeId` (reverse lookup during save).
    pub fn entry_for_type(&self, type_id: TypeId) -> Option<&TypeInfo> {
        self.by_type.get(&type_id).map(|&i| &self.entries[i].info)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SaveableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveableRegistry")
            .field("types", &self.entries.len())
            .finish()
    }
}
