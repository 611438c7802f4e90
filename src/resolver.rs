//! resolver
//!
//! Reference identity allocation and deferred reference resolution.
//!
//! # Architecture
//!
//! One [`ReferenceResolver`] is scoped to a single save or load pass and is
//! torn down with that pass. Stale counters or stale pending callbacks
//! leaking into a later pass would corrupt identity stability, so the
//! orchestrator constructs a fresh resolver per pass and lets it drop at
//! the end of every exit path.
//!
//! Instead of push-style notifications, the resolver exposes two explicit
//! worklists the orchestrator drains:
//!
//! - **discoveries** (save): first-time [`ReferenceResolver::allocate`]
//!   calls enqueue the object so the pass can schedule saving it
//! - **requests** (load): [`ReferenceResolver::request`] for an identity
//!   with no materialized object enqueues it so the pass can schedule
//!   materializing it
//!
//! This is a pull-based graph walk: a cycle just means an identity is
//! already allocated (save) or already requested (load), so it is never
//! revisited, and a forward reference is merely a request that settles
//! later. No separate cycle detection is needed.
//!
//! # Callback discipline
//!
//! Load callbacks fire exactly once: either immediately (target already
//! materialized), on [`ReferenceResolver::mark_ready`], or as not-found in
//! [`ReferenceResolver::drain_unresolved`]. Callbacks must only touch
//! promise cells (see [`crate::saveable::RefSlot`]), never the requesting
//! object; that is what makes immediate invocation safe while the
//! requester is mid-`load`.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::core::types::ReferenceId;
use crate::saveable::{handle_key, Saveable, SaveableRef};

/// Callback for one requested reference: `(found, object)`.
pub type LoadCallback = Box<dyn FnOnce(bool, Option<SaveableRef>)>;

/// Callback for a batched reference request, in request order.
pub type LoadManyCallback = Box<dyn FnOnce(Vec<Option<SaveableRef>>)>;

struct MultiRequest {
    remaining: usize,
    results: Vec<Option<SaveableRef>>,
    callback: Option<LoadManyCallback>,
}

/// Pass-scoped reference identity resolver.
pub struct ReferenceResolver {
    counter: u64,
    /// Live object → identity, keyed by allocation address with a `Weak`
    /// liveness guard against address reuse.
    ids: HashMap<usize, (Weak<RefCell<dyn Saveable>>, ReferenceId)>,
    /// Identity → materialized object.
    objects: BTreeMap<ReferenceId, SaveableRef>,
    /// Queued callbacks per unresolved identity, in arrival order.
    pending: BTreeMap<ReferenceId, Vec<LoadCallback>>,
    /// Aggregators for batched requests, by caller-chosen group key.
    groups: HashMap<String, Rc<RefCell<MultiRequest>>>,
    requested_seen: BTreeSet<ReferenceId>,
    discovered: VecDeque<(ReferenceId, SaveableRef)>,
    requested: VecDeque<ReferenceId>,
    /// Handle of the capsule whose graph is currently being walked.
    scope_root: Option<usize>,
    /// Objects bound to the shared root identity that were referenced from
    /// a scope they do not own.
    foreign_roots: Vec<SaveableRef>,
}

impl ReferenceResolver {
    /// Fresh resolver for one pass.
    pub fn new() -> Self {
        Self {
            counter: 0,
            ids: HashMap::new(),
            objects: BTreeMap::new(),
            pending: BTreeMap::new(),
            groups: HashMap::new(),
            requested_seen: BTreeSet::new(),
            discovered: VecDeque::new(),
            requested: VecDeque::new(),
            scope_root: None,
            foreign_roots: Vec::new(),
        }
    }

    // ---- save side ---------------------------------------------------------

    /// Identity for an object, allocating on first sight.
    ///
    /// The first call for an object takes the next counter value and
    /// enqueues a discovery so the pass saves the object; repeat calls
    /// return the cached identity without re-enqueueing.
    pub fn allocate(&mut self, object: &SaveableRef) -> ReferenceId {
        let key = handle_key(object);
        if let Some((weak, id)) = self.ids.get(&key) {
            // Address reuse: the old entry is stale once its object died.
            if weak.upgrade().is_some() {
                if id.is_root() && self.scope_root.is_some_and(|root| root != key) {
                    // Root-bound object referenced from a scope it does not
                    // own. The shared root identity cannot express this, so
                    // record it for the pass to reject.
                    self.foreign_roots.push(object.clone());
                }
                return id.clone();
            }
        }

        let id = ReferenceId::from_counter(self.counter);
        self.counter += 1;
        self.ids.insert(key, (Rc::downgrade(object), id.clone()));
        self.discovered.push_back((id.clone(), object.clone()));
        id
    }

    /// Bind an object to a fixed identity without scheduling it.
    pub fn bind(&mut self, object: &SaveableRef, id: ReferenceId) {
        self.ids
            .insert(handle_key(object), (Rc::downgrade(object), id));
    }

    /// Bind an object to a fixed identity and enqueue it for saving.
    /// Used to seed each capsule root under the reserved root identity, so
    /// a child referencing its own capsule resolves to the root instead of
    /// a duplicate numeric identity.
    pub fn seed(&mut self, object: &SaveableRef, id: ReferenceId) {
        self.bind(object, id.clone());
        self.discovered.push_back((id, object.clone()));
    }

    /// Mark the object whose graph the pass is about to walk. References to
    /// a different root-bound object made inside this scope are collected
    /// as foreign (see [`Self::take_foreign_roots`]).
    pub fn begin_scope(&mut self, root: &SaveableRef) {
        self.scope_root = Some(handle_key(root));
    }

    /// Drain the foreign root-bound objects referenced since the scope
    /// began.
    pub fn take_foreign_roots(&mut self) -> Vec<SaveableRef> {
        std::mem::take(&mut self.foreign_roots)
    }

    /// Pop the next discovered (identity, object) pair, if any.
    pub fn take_discovered(&mut self) -> Option<(ReferenceId, SaveableRef)> {
        self.discovered.pop_front()
    }

    // ---- load side ---------------------------------------------------------

    /// Ask for the object behind an identity.
    ///
    /// Invokes `callback` immediately when the identity is already
    /// materialized; otherwise queues it (arrival order) and enqueues a
    /// materialization request for the pass to pick up.
    pub fn request(&mut self, id: ReferenceId, callback: LoadCallback) {
        if let Some(object) = self.objects.get(&id) {
            callback(true, Some(object.clone()));
            return;
        }
        self.pending.entry(id.clone()).or_default().push(callback);
        self.enqueue_request(id);
    }

    /// Ask for a whole identity list at once.
    ///
    /// The batched callback fires exactly once, after every member has
    /// settled, with one entry per requested identity in request order
    /// (`None` for identities that never materialized). An empty list
    /// settles immediately.
    pub fn request_many(&mut self, group_key: &str, ids: &[ReferenceId], callback: LoadManyCallback) {
        if ids.is_empty() {
            callback(Vec::new());
            return;
        }

        let state = Rc::new(RefCell::new(MultiRequest {
            remaining: ids.len(),
            results: vec![None; ids.len()],
            callback: Some(callback),
        }));
        // Group keys are caller-chosen bookkeeping; resolution itself flows
        // through the shared state, so a colliding key cannot break it.
        // Two objects loading a list under the same storage key collide
        // here legitimately.
        self.groups.insert(group_key.to_string(), state.clone());

        for (index, id) in ids.iter().cloned().enumerate() {
            let state = state.clone();
            self.request(
                id,
                Box::new(move |found, object| {
                    let mut inner = state.borrow_mut();
                    if found {
                        inner.results[index] = object;
                    }
                    inner.remaining -= 1;
                    if inner.remaining == 0 {
                        if let Some(callback) = inner.callback.take() {
                            let results = std::mem::take(&mut inner.results);
                            drop(inner);
                            callback(results);
                        }
                    }
                }),
            );
        }
    }

    /// Enqueue a materialization request without a callback. Used by the
    /// orchestrator to seed the root identity.
    pub fn enqueue_request(&mut self, id: ReferenceId) {
        if self.objects.contains_key(&id) {
            return;
        }
        if self.requested_seen.insert(id.clone()) {
            self.requested.push_back(id);
        }
    }

    /// Pop the next identity awaiting materialization, if any.
    pub fn take_requested(&mut self) -> Option<ReferenceId> {
        self.requested.pop_front()
    }

    /// Bind an identity to its materialized object and flush that
    /// identity's queued callbacks in arrival order. First bind wins.
    pub fn mark_ready(&mut self, object: &SaveableRef, id: &ReferenceId) {
        let resolved = self
            .objects
            .entry(id.clone())
            .or_insert_with(|| object.clone())
            .clone();
        if let Some(callbacks) = self.pending.remove(id) {
            for callback in callbacks {
                callback(true, Some(resolved.clone()));
            }
        }
    }

    /// Settle every still-pending identity as not-found.
    ///
    /// Guarantees each queued callback is invoked exactly once even for
    /// dangling or missing references, so a load pass can never hang.
    pub fn drain_unresolved(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (id, callbacks) in pending {
            warn!(reference = %id, waiters = callbacks.len(), "resolving unknown reference as not-found");
            for callback in callbacks {
                callback(false, None);
            }
        }
    }

    /// Whether any request is still waiting on an object.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Default for ReferenceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReferenceResolver {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                waiters = self.pending.len(),
                "resolver dropped with unsettled requests"
            );
        }
        self.groups.clear();
        self.pending.clear();
    }
}

impl std::fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceResolver")
            .field("counter", &self.counter)
            .field("resolved", &self.objects.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
