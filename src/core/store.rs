//! core::store
//!
//! Per-identity attribute store: the record behind one saved reference.
//!
//! # Architecture
//!
//! An [`AttributeStore`] holds two disjoint channels keyed by strings:
//!
//! - **values** - self-describing [`ValueSection`]s
//! - **references** - reference identities (single, or comma-joined lists)
//!
//! Both maps are ordered so persisted output is deterministic.
//!
//! # The amnesty list
//!
//! Every successful [`AttributeStore::set_value`] (other than writing the
//! list itself) appends the key to the amnesty list, and the list is
//! persisted as an ordinary value under a reserved key. On the next save
//! pass, a value key present in the previous store but not rewritten is
//! copied forward verbatim iff it is on that list; everything else not
//! rewritten is dropped. This lets an object own only the keys it actively
//! manages per save without losing keys injected by other code paths (the
//! migration cursor being the canonical example).
//!
//! The save-pass write path ([`AttributeStore::write`]) deliberately does
//! the opposite: a freshly written key is owned by its writer again, so it
//! is removed from the list.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use super::codec::{SaveableArray, StoreValue};
use super::section::{CodecError, ValueSection};
use super::types::{keys, CapsuleId, ReferenceId};

/// Separator for multi-reference values.
const REFERENCE_LIST_SEPARATOR: char = ',';

/// Errors from attribute store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The amnesty bookkeeping key cannot be written directly.
    #[error("key '{0}' is reserved for engine bookkeeping")]
    ReservedKey(String),

    /// Value failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The per-identity record of value keys and reference keys.
#[derive(Debug, Clone)]
pub struct AttributeStore {
    capsule_id: CapsuleId,
    values: BTreeMap<String, ValueSection>,
    references: BTreeMap<String, String>,
    keep_keys: Vec<String>,
}

impl AttributeStore {
    /// Fresh empty store belonging to the given capsule.
    pub fn new(capsule_id: CapsuleId) -> Self {
        Self {
            capsule_id,
            values: BTreeMap::new(),
            references: BTreeMap::new(),
            keep_keys: Vec::new(),
        }
    }

    /// Rebuild a store from decoded file content.
    ///
    /// The amnesty list is recovered from its reserved value key; an
    /// unreadable list is logged and treated as empty.
    pub fn from_parts(
        capsule_id: CapsuleId,
        values: BTreeMap<String, ValueSection>,
        references: BTreeMap<String, String>,
    ) -> Self {
        let mut store = Self {
            capsule_id,
            values,
            references,
            keep_keys: Vec::new(),
        };
        if let Some(section) = store.values.get(keys::VALUE_KEYS_TO_KEEP) {
            match SaveableArray::decode(section).and_then(|a| a.to_values::<String>()) {
                Ok(keep) => store.keep_keys = keep,
                Err(err) => warn!(
                    capsule = %store.capsule_id,
                    error = %err,
                    "unreadable amnesty list; treating as empty"
                ),
            }
        }
        store
    }

    /// Capsule this store belongs to.
    pub fn capsule_id(&self) -> &CapsuleId {
        &self.capsule_id
    }

    // ---- value channel -----------------------------------------------------

    /// Save-pass write: encode and insert a value.
    ///
    /// The key becomes owned by this pass's writer, so it is removed from
    /// the amnesty list rather than enrolled in it.
    ///
    /// # Errors
    ///
    /// `StoreError::ReservedKey` for the amnesty key itself, or an encode
    /// failure.
    pub fn write<T: StoreValue>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        self.write_section(key, value.encode()?)
    }

    /// Save-pass write of an already-encoded section. See [`Self::write`].
    ///
    /// # Errors
    ///
    /// `StoreError::ReservedKey` for the amnesty key itself.
    pub fn write_section(&mut self, key: &str, section: ValueSection) -> Result<(), StoreError> {
        if key == keys::VALUE_KEYS_TO_KEEP {
            return Err(StoreError::ReservedKey(key.to_string()));
        }
        self.values.insert(key.to_string(), section);
        self.keep_keys.retain(|k| k != key);
        Ok(())
    }

    /// Editor/migration write: encode, insert, and enroll the key in the
    /// amnesty list so it survives save passes that do not rewrite it.
    ///
    /// # Errors
    ///
    /// `StoreError::ReservedKey` for the amnesty key itself, or an encode
    /// failure.
    pub fn set_value<T: StoreValue>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        self.set_section(key, value.encode()?)
    }

    /// Editor/migration write of an already-encoded section. See
    /// [`Self::set_value`].
    ///
    /// # Errors
    ///
    /// `StoreError::ReservedKey` for the amnesty key itself, or an amnesty
    /// list encode failure.
    pub fn set_section(&mut self, key: &str, section: ValueSection) -> Result<(), StoreError> {
        if key == keys::VALUE_KEYS_TO_KEEP {
            return Err(StoreError::ReservedKey(key.to_string()));
        }
        self.values.insert(key.to_string(), section);
        if !self.keep_keys.iter().any(|k| k == key) {
            self.keep_keys.push(key.to_string());
        }
        self.persist_keep_keys()
    }

    /// Typed read of a value.
    ///
    /// # Errors
    ///
    /// Decode failure for a present-but-unreadable section; `Ok(None)` when
    /// the key is absent.
    pub fn get<T: StoreValue>(&self, key: &str) -> Result<Option<T>, CodecError> {
        match self.values.get(key) {
            Some(section) => T::decode(section).map(Some),
            None => Ok(None),
        }
    }

    /// Raw section access.
    pub fn section(&self, key: &str) -> Option<&ValueSection> {
        self.values.get(key)
    }

    /// Whether a value key is present.
    pub fn has_value(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All value keys, in stored (sorted) order.
    pub fn value_keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Whether a value key is on the amnesty list.
    pub fn should_keep(&self, key: &str) -> bool {
        self.keep_keys.iter().any(|k| k == key)
    }

    /// Remove a value key and un-enroll it from the amnesty list.
    ///
    /// A removed key must not reappear through copy-forward on the next
    /// save.
    ///
    /// # Errors
    ///
    /// Amnesty list encode failure.
    pub fn remove_value(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        self.keep_keys.retain(|k| k != key);
        self.persist_keep_keys()
    }

    /// Move a value to a new key (copy + delete); the section is carried
    /// verbatim. Used by migrations.
    ///
    /// # Errors
    ///
    /// Amnesty list encode failure.
    pub fn relocate_value(&mut self, current_key: &str, new_key: &str) -> Result<(), StoreError> {
        if let Some(section) = self.values.get(current_key).cloned() {
            self.remove_value(current_key)?;
            self.set_section(new_key, section)?;
        }
        Ok(())
    }

    /// Insert without any amnesty bookkeeping. Engine-internal: the amnesty
    /// list's own persistence and envelope decoding go through here.
    pub(crate) fn insert_raw(&mut self, key: &str, section: ValueSection) {
        self.values.insert(key.to_string(), section);
    }

    fn persist_keep_keys(&mut self) -> Result<(), StoreError> {
        let list = SaveableArray::from_values(&self.keep_keys)?;
        let section = list.encode()?;
        self.insert_raw(keys::VALUE_KEYS_TO_KEEP, section);
        Ok(())
    }

    // ---- reference channel -------------------------------------------------

    /// Bind a reference key to a single identity.
    pub fn set_reference(&mut self, key: &str, id: &ReferenceId) {
        self.references.insert(key.to_string(), id.to_string());
    }

    /// Bind a reference key to a list of identities (comma-joined).
    pub fn set_references(&mut self, key: &str, ids: &[ReferenceId]) {
        let joined = ids
            .iter()
            .map(ReferenceId::as_str)
            .collect::<Vec<_>>()
            .join(&REFERENCE_LIST_SEPARATOR.to_string());
        self.references.insert(key.to_string(), joined);
    }

    /// Raw stored form of a reference key.
    pub fn reference_raw(&self, key: &str) -> Option<&str> {
        self.references.get(key).map(String::as_str)
    }

    /// Identities stored under a reference key (one or many; empty when the
    /// key is absent).
    pub fn reference_ids(&self, key: &str) -> Vec<ReferenceId> {
        let Some(raw) = self.references.get(key) else {
            return Vec::new();
        };
        raw.split(REFERENCE_LIST_SEPARATOR)
            .filter(|part| !part.is_empty())
            .filter_map(|part| ReferenceId::parse(part).ok())
            .collect()
    }

    /// Whether a reference key is present.
    pub fn has_reference(&self, key: &str) -> bool {
        self.references.contains_key(key)
    }

    /// All reference keys, in stored (sorted) order.
    pub fn reference_keys(&self) -> impl Iterator<Item = &str> {
        self.references.keys().map(String::as_str)
    }

    /// Remove a reference key.
    pub fn remove_reference(&mut self, key: &str) {
        self.references.remove(key);
    }

    /// Move a reference binding to a new key (copy + delete). Used by
    /// migrations.
    pub fn relocate_reference(&mut self, current_key: &str, new_key: &str) {
        if let Some(raw) = self.references.remove(current_key) {
            self.references.insert(new_key.to_string(), raw);
        }
    }

    // ---- envelope access ---------------------------------------------------

    /// Iterate the value channel for envelope building.
    pub(crate) fn values_iter(&self) -> impl Iterator<Item = (&str, &ValueSection)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate the reference channel for envelope building.
    pub(crate) fn references_iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.references.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
