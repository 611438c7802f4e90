//! Keepsake - object-graph persistence with stable identities
//!
//! Keepsake saves and loads graphs of interrelated objects: each root
//! object (a capsule) owns one save file, objects reachable from it are
//! discovered and persisted automatically, shared objects keep one
//! identity, and cycles are handled without any cycle-detection pass.
//! Values are stored self-describing, so files written by an older build
//! remain readable and migratable.
//!
//! # Architecture
//!
//! The codebase follows a strict layered architecture:
//!
//! - [`cli`] - Command-line interface layer (parses args, delegates to inspect)
//! - [`core`] - Value sections, typed codecs, attribute stores, identities
//! - [`saveable`] - The object-side traits and reference promise cells
//! - [`registry`] - Type registration and materialization
//! - [`resolver`] - Identity allocation and deferred reference resolution
//! - [`channel`] - The save/load surface handed to objects
//! - [`storage`] - The orchestrator, wire format, paths, and locking
//! - [`migrate`] - Ordered, reversible schema migrations
//! - [`inspect`] - Offline validation and maintenance of save files
//!
//! # Correctness Invariants
//!
//! Keepsake maintains the following invariants:
//!
//! 1. An object reachable from several places is saved once and keeps one
//!    identity within its pass
//! 2. Every reference request settles exactly once, found or not
//! 3. A failed save or load pass leaves the previous cached state intact
//! 4. Files are replaced atomically; readers never observe partial writes

pub mod channel;
pub mod cli;
pub mod core;
pub mod inspect;
pub mod migrate;
pub mod registry;
pub mod resolver;
pub mod saveable;
pub mod storage;

pub use crate::channel::{Loader, Saver};
pub use crate::core::codec::{SaveableArray, SaveableDict, StoreValue};
pub use crate::core::section::{TypeTag, ValueSection};
pub use crate::core::store::AttributeStore;
pub use crate::core::types::{CapsuleId, ReferenceId};
pub use crate::migrate::{Migration, Migrator};
pub use crate::registry::SaveableRegistry;
pub use crate::saveable::{
    as_saveable, saveable, Capsule, RefListSlot, RefSlot, Saveable, SaveableRef,
};
pub use crate::storage::{Encoding, Storage, StorageError, StoragePaths};
