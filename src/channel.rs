//! channel
//!
//! The save/load surface handed to [`Saveable`] objects.
//!
//! # Architecture
//!
//! Objects never see the attribute store or the resolver directly. A
//! [`Saver`] couples the object's store with the pass resolver so that
//! writing a reference transparently allocates (and schedules) its
//! identity; a [`Loader`] couples them so that reading a reference hands
//! back a promise cell that settles when the pass materializes the target.
//!
//! Value-channel failures are deliberately non-fatal on this surface: a
//! value that cannot be encoded is logged and dropped, a value that cannot
//! be decoded is logged and read as absent. One bad key must not take the
//! rest of the object's state with it.

use tracing::{error, warn};

use crate::core::codec::StoreValue;
use crate::core::store::AttributeStore;
use crate::resolver::{LoadCallback, LoadManyCallback, ReferenceResolver};
use crate::saveable::{as_saveable, RefListSlot, RefSlot, Saveable, SaveableRef};

use std::cell::RefCell;
use std::rc::Rc;

/// Write surface for one object during a save pass.
pub struct Saver<'a> {
    store: &'a mut AttributeStore,
    resolver: &'a mut ReferenceResolver,
}

impl<'a> Saver<'a> {
    pub(crate) fn new(store: &'a mut AttributeStore, resolver: &'a mut ReferenceResolver) -> Self {
        Self { store, resolver }
    }

    /// Write a typed value. An unwritable value is logged and dropped.
    pub fn value<T: StoreValue>(&mut self, key: &str, value: &T) {
        if let Err(err) = self.store.write(key, value) {
            error!(
                capsule = %self.store.capsule_id(),
                key,
                error = %err,
                "dropping unwritable value"
            );
        }
    }

    /// Write a single reference, allocating its identity on first sight.
    pub fn reference<T: Saveable>(&mut self, key: &str, handle: &Rc<RefCell<T>>) {
        self.reference_dyn(key, &as_saveable(handle));
    }

    /// Type-erased form of [`Self::reference`].
    pub fn reference_dyn(&mut self, key: &str, object: &SaveableRef) {
        let id = self.resolver.allocate(object);
        self.store.set_reference(key, &id);
    }

    /// Write a reference list, allocating identities in list order.
    pub fn references(&mut self, key: &str, objects: &[SaveableRef]) {
        let ids: Vec<_> = objects.iter().map(|o| self.resolver.allocate(o)).collect();
        self.store.set_references(key, &ids);
    }
}

/// Read surface for one object during a load pass.
pub struct Loader<'a> {
    store: &'a AttributeStore,
    resolver: &'a mut ReferenceResolver,
}

impl<'a> Loader<'a> {
    pub(crate) fn new(store: &'a AttributeStore, resolver: &'a mut ReferenceResolver) -> Self {
        Self { store, resolver }
    }

    /// Read a typed value. Absent and unreadable keys both come back as
    /// `None`; the unreadable case is logged.
    pub fn value<T: StoreValue>(&self, key: &str) -> Option<T> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    capsule = %self.store.capsule_id(),
                    key,
                    error = %err,
                    "unreadable value; reading as absent"
                );
                None
            }
        }
    }

    /// Whether a value key is present.
    pub fn has_value(&self, key: &str) -> bool {
        self.store.has_value(key)
    }

    /// Whether a reference key is present.
    pub fn has_reference(&self, key: &str) -> bool {
        self.store.has_reference(key)
    }

    /// Request the reference stored under `key`.
    ///
    /// Returns a promise cell: already settled as not-found when the key is
    /// absent, settled immediately when the target is materialized, and
    /// settled later in the pass otherwise. Harvest it in
    /// [`Saveable::load_completed`].
    pub fn reference(&mut self, key: &str) -> RefSlot {
        let mut ids = self.store.reference_ids(key);
        let Some(id) = ids.drain(..).next() else {
            return RefSlot::not_found();
        };
        let slot = RefSlot::pending();
        let settle = slot.clone();
        self.resolver
            .request(id, Box::new(move |_found, object| settle.settle(object)));
        slot
    }

    /// Request the reference list stored under `key`.
    ///
    /// The cell settles once every member has, preserving stored order;
    /// members that never materialize settle as gaps. An absent key settles
    /// immediately as an empty list.
    pub fn references(&mut self, key: &str) -> RefListSlot {
        let slot = RefListSlot::pending();
        let settle = slot.clone();
        if !self.store.has_reference(key) {
            slot.settle(Vec::new());
            return slot;
        }
        let ids = self.store.reference_ids(key);
        self.resolver
            .request_many(key, &ids, Box::new(move |objects| settle.settle(objects)));
        slot
    }

    /// Raw-callback form of [`Self::reference`]. The callback must only
    /// touch promise cells, never the requesting object.
    pub fn reference_with(&mut self, key: &str, callback: LoadCallback) {
        match self.store.reference_ids(key).into_iter().next() {
            Some(id) => self.resolver.request(id, callback),
            None => callback(false, None),
        }
    }

    /// Raw-callback form of [`Self::references`].
    pub fn references_with(&mut self, key: &str, callback: LoadManyCallback) {
        if !self.store.has_reference(key) {
            callback(Vec::new());
            return;
        }
        let ids = self.store.reference_ids(key);
        self.resolver.request_many(key, &ids, callback);
    }
}
