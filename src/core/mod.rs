//! core
//!
//! Pure domain data for the persistence engine: identifiers and reserved
//! keys, self-describing value sections, the typed codec, and the
//! per-identity attribute store. Nothing here touches disk or holds live
//! object handles; those concerns live in [`crate::storage`] and
//! [`crate::resolver`].

pub mod codec;
pub mod section;
pub mod store;
pub mod types;

pub use codec::{SaveableArray, SaveableDict, StoreValue};
pub use section::{CodecError, DictEntry, DynValue, TypeTag, ValueSection};
pub use store::{AttributeStore, StoreError};
pub use types::{keys, CapsuleId, ReferenceId, TypeError, ROOT_REFERENCE_ID};
