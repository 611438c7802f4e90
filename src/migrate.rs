//! migrate
//!
//! Ordered schema migrations over persisted capsule state.
//!
//! A [`Migrator`] holds a fixed sequence of [`Migration`] steps. Each
//! capsule tracks how many of its steps have been applied in a cursor
//! stored under a reserved root key, so running the migrator again only
//! applies what is new and undoing walks the applied steps backwards.
//! The cursor is written through the amnesty mechanism, which keeps it
//! alive across save passes that know nothing about migrations.
//!
//! Steps mutate cached stores through the [`ReadResult`] surface, never
//! live objects; run migrations before [`Storage::load`] so objects only
//! ever see migrated state.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::store::StoreError;
use crate::core::types::{keys, CapsuleId};
use crate::storage::{ReadResult, Storage, StorageError};

/// Error type migration steps may return.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from running or undoing migrations.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// A migration step failed. The cursor of completed steps was
    /// persisted before returning.
    #[error("migration step {index} for capsule '{capsule}' failed")]
    Step {
        capsule: CapsuleId,
        index: usize,
        #[source]
        source: StepError,
    },

    /// Underlying storage operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Cursor bookkeeping failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One reversible schema change for one capsule.
pub trait Migration {
    /// Capsule this step applies to.
    fn capsule_id(&self) -> CapsuleId;

    /// Transform the capsule's cached stores forward.
    ///
    /// # Errors
    ///
    /// Any failure; the migrator records completed steps and stops.
    fn apply(&self, capsule: &ReadResult) -> Result<(), StepError>;

    /// Transform the capsule's cached stores back.
    ///
    /// # Errors
    ///
    /// Any failure; the migrator records the remaining cursor and stops.
    fn revert(&self, capsule: &ReadResult) -> Result<(), StepError>;
}

/// Runs an ordered list of migration steps against a [`Storage`].
#[derive(Default)]
pub struct Migrator {
    steps: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// Migrator with no steps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step. Order of insertion is order of application.
    pub fn push(&mut self, step: impl Migration + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Builder form of [`Self::push`].
    #[must_use]
    pub fn with_step(mut self, step: impl Migration + 'static) -> Self {
        self.push(step);
        self
    }

    /// Number of registered steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no steps are registered.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Apply every not-yet-applied step, per capsule, persisting the
    /// cursor when it moved. An already-current capsule is left untouched
    /// on disk.
    ///
    /// Capsules that are unmanaged or have no save file yet are skipped;
    /// a fresh save needs no migrating.
    ///
    /// # Errors
    ///
    /// The first failing step (its cursor already persisted), or a
    /// storage failure.
    pub fn run(&self, storage: &mut Storage) -> Result<(), MigrateError> {
        for (capsule_id, steps) in self.grouped() {
            if !self.migratable(storage, &capsule_id) {
                continue;
            }
            let capsule = storage.read_capsule(&capsule_id)?;
            let mut cursor = read_cursor(&capsule);
            let initial = cursor;

            for (position, step) in steps.iter().enumerate() {
                if (position as i64) < cursor {
                    continue;
                }
                debug!(capsule = %capsule_id, step = position, "applying migration");
                if let Err(source) = step.apply(&capsule) {
                    if cursor != initial {
                        persist_cursor(storage, &capsule, cursor)?;
                    }
                    return Err(MigrateError::Step {
                        capsule: capsule_id,
                        index: position,
                        source,
                    });
                }
                cursor = position as i64 + 1;
            }

            if cursor == initial {
                debug!(capsule = %capsule_id, cursor, "migrations already current");
                continue;
            }
            persist_cursor(storage, &capsule, cursor)?;
            info!(capsule = %capsule_id, cursor, "migrations applied");
        }
        Ok(())
    }

    /// Revert every applied step, per capsule, newest first, persisting
    /// the cursor when it moved.
    ///
    /// # Errors
    ///
    /// The first failing step (its cursor already persisted), or a
    /// storage failure.
    pub fn undo(&self, storage: &mut Storage) -> Result<(), MigrateError> {
        for (capsule_id, steps) in self.grouped() {
            if !self.migratable(storage, &capsule_id) {
                continue;
            }
            let capsule = storage.read_capsule(&capsule_id)?;
            let mut cursor = read_cursor(&capsule).clamp(0, steps.len() as i64);
            let initial = cursor;

            while cursor > 0 {
                let position = (cursor - 1) as usize;
                debug!(capsule = %capsule_id, step = position, "reverting migration");
                if let Err(source) = steps[position].revert(&capsule) {
                    if cursor != initial {
                        persist_cursor(storage, &capsule, cursor)?;
                    }
                    return Err(MigrateError::Step {
                        capsule: capsule_id,
                        index: position,
                        source,
                    });
                }
                cursor -= 1;
            }

            if cursor == initial {
                debug!(capsule = %capsule_id, cursor, "nothing to revert");
                continue;
            }
            persist_cursor(storage, &capsule, cursor)?;
            info!(capsule = %capsule_id, "migrations reverted");
        }
        Ok(())
    }

    /// Steps grouped by capsule, groups in first-seen order.
    fn grouped(&self) -> Vec<(CapsuleId, Vec<&dyn Migration>)> {
        let mut order: Vec<CapsuleId> = Vec::new();
        let mut groups: HashMap<CapsuleId, Vec<&dyn Migration>> = HashMap::new();
        for step in &self.steps {
            let id = step.capsule_id();
            if !groups.contains_key(&id) {
                order.push(id.clone());
            }
            groups.entry(id).or_default().push(step.as_ref());
        }
        order
            .into_iter()
            .map(|id| {
                let steps = groups.remove(&id).unwrap_or_default();
                (id, steps)
            })
            .collect()
    }

    fn migratable(&self, storage: &Storage, capsule_id: &CapsuleId) -> bool {
        if !storage.capsule_ids().contains(capsule_id) {
            warn!(capsule = %capsule_id, "migration targets an unmanaged capsule; skipping");
            return false;
        }
        if !storage.paths().capsule_file(capsule_id).is_file() {
            debug!(capsule = %capsule_id, "no save file yet; nothing to migrate");
            return false;
        }
        true
    }
}

/// Applied-step count for a capsule. Missing or unreadable reads as zero.
fn read_cursor(capsule: &ReadResult) -> i64 {
    match capsule.root.borrow().get::<i64>(keys::MIGRATOR_INDEX) {
        Ok(Some(cursor)) => cursor,
        Ok(None) => 0,
        Err(err) => {
            warn!(
                capsule = %capsule.capsule_id,
                error = %err,
                "unreadable migration cursor; treating as zero"
            );
            0
        }
    }
}

fn persist_cursor(
    storage: &mut Storage,
    capsule: &ReadResult,
    cursor: i64,
) -> Result<(), MigrateError> {
    capsule
        .root
        .borrow_mut()
        .set_value(keys::MIGRATOR_INDEX, &cursor)?;
    storage.flush(&[capsule.capsule_id.clone()])?;
    Ok(())
}
