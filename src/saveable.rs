//! saveable
//!
//! The participation contract for persisted objects.
//!
//! # Architecture
//!
//! Anything stored by the engine implements [`Saveable`] and is held as a
//! [`SaveableRef`], a shared, interior-mutable handle. Identity is handle
//! identity (the `Rc` allocation), never a persisted field; the resolver
//! maps handles to reference identities per pass.
//!
//! Capsule roots additionally implement [`Capsule`] to expose their stable
//! string id.
//!
//! # Deferred references
//!
//! During a load pass an object may ask for references to objects that do
//! not exist yet. The answer arrives through a promise cell: [`RefSlot`]
//! for a single reference, [`RefListSlot`] for a batch. Slots are filled by
//! the resolver as targets materialize (or are drained as not-found at the
//! end of the pass) and are safe to hold across the whole pass: filling a
//! slot never touches the object that requested it, which is what makes
//! immediate resolution of already-materialized targets re-entrancy safe.
//! Objects move resolved slots into their real fields in
//! [`Saveable::load_completed`].

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::channel::{Loader, Saver};
use crate::core::types::CapsuleId;

/// Shared handle to a persisted object.
pub type SaveableRef = Rc<RefCell<dyn Saveable>>;

/// An object participating in the persistence graph.
///
/// The three callbacks mirror the engine's pass structure: `save` writes the
/// object's keys into a fresh store, `load` reads values and requests
/// references, and `load_completed` runs after the whole graph of a pass has
/// been walked (in reverse discovery order), which is where requested
/// reference slots are guaranteed to be settled.
pub trait Saveable: Any {
    /// Write this object's values and references for the current save pass.
    fn save(&self, saver: &mut Saver<'_>);

    /// Read this object's values and request its references.
    fn load(&mut self, loader: &mut Loader<'_>);

    /// Called once the pass has settled every reference request.
    fn load_completed(&mut self) {}

    /// Upcast for registry type lookup and downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Diagnostic label for this type. The registry name is authoritative
    /// for persistence; this is only used in log messages for types the
    /// registry does not know.
    fn type_label(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A named root object owning one connected subgraph of references.
pub trait Capsule: Saveable {
    /// Stable identifier; doubles as the save file name stem.
    fn capsule_id(&self) -> CapsuleId;
}

/// Wrap a value into a shared saveable handle.
pub fn saveable<T: Saveable>(value: T) -> Rc<RefCell<T>> {
    Rc::new(RefCell::new(value))
}

/// Erase a concrete handle into a [`SaveableRef`].
pub fn as_saveable<T: Saveable>(handle: &Rc<RefCell<T>>) -> SaveableRef {
    handle.clone()
}

/// Stable per-allocation key for identity maps. Derived from the `Rc`
/// allocation address; callers must pair it with a `Weak` liveness check
/// because addresses can be reused after the object is dropped.
pub(crate) fn handle_key(handle: &SaveableRef) -> usize {
    Rc::as_ptr(handle) as *const () as usize
}

#[derive(Default)]
struct SlotState {
    settled: bool,
    value: Option<SaveableRef>,
}

/// Promise cell for one requested reference.
///
/// Cloning shares the cell. `Default` is a fresh pending slot, so slot
/// fields work with `#[derive(Default)]` on the owning type.
#[derive(Clone, Default)]
pub struct RefSlot {
    state: Rc<RefCell<SlotState>>,
}

impl RefSlot {
    /// A fresh, unsettled slot.
    pub fn pending() -> Self {
        Self::default()
    }

    /// A slot that is already settled as not-found. Returned when the
    /// requested key held no identity at all.
    pub(crate) fn not_found() -> Self {
        let slot = Self::default();
        slot.settle(None);
        slot
    }

    /// Settle the slot. Exactly-once: later calls are ignored.
    pub(crate) fn settle(&self, value: Option<SaveableRef>) {
        let mut state = self.state.borrow_mut();
        if !state.settled {
            state.settled = true;
            state.value = value;
        }
    }

    /// Whether the pass has answered this request yet.
    pub fn is_settled(&self) -> bool {
        self.state.borrow().settled
    }

    /// The resolved handle, if the target was found.
    pub fn get(&self) -> Option<SaveableRef> {
        self.state.borrow().value.clone()
    }

    /// Take the resolved handle out of the slot.
    pub fn take(&self) -> Option<SaveableRef> {
        self.state.borrow_mut().value.take()
    }
}

impl std::fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("RefSlot")
            .field("settled", &state.settled)
            .field("resolved", &state.value.is_some())
            .finish()
    }
}

#[derive(Default)]
struct ListSlotState {
    settled: bool,
    values: Vec<Option<SaveableRef>>,
}

/// Promise cell for a batched reference request.
///
/// Settles once, with one entry per requested identity in request order;
/// identities that never materialized are `None`.
#[derive(Clone, Default)]
pub struct RefListSlot {
    state: Rc<RefCell<ListSlotState>>,
}

impl RefListSlot {
    /// A fresh, unsettled slot.
    pub fn pending() -> Self {
        Self::default()
    }

    /// Settle the slot. Exactly-once: later calls are ignored.
    pub(crate) fn settle(&self, values: Vec<Option<SaveableRef>>) {
        let mut state = self.state.borrow_mut();
        if !state.settled {
            state.settled = true;
            state.values = values;
        }
    }

    /// Whether the pass has answered this request yet.
    pub fn is_settled(&self) -> bool {
        self.state.borrow().settled
    }

    /// Resolved handles only, in request order.
    pub fn get(&self) -> Vec<SaveableRef> {
        self.state
            .borrow()
            .values
            .iter()
            .filter_map(|v| v.clone())
            .collect()
    }

    /// Full per-identity view, `None` for identities that were not found.
    pub fn raw(&self) -> Vec<Option<SaveableRef>> {
        self.state.borrow().values.clone()
    }
}

impl std::fmt::Debug for RefListSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("RefListSlot")
            .field("settled", &state.settled)
            .field("len", &state.values.len())
            .finish()
    }
}
