//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`CapsuleId`] - Validated capsule identifier (doubles as the save file stem)
//! - [`ReferenceId`] - Per-pass reference identity inside a capsule
//!
//! # Validation
//!
//! These types enforce validity at construction time. A [`CapsuleId`] names a
//! file under the storage root, so anything that could escape the directory
//! (separators, `..`, empty strings) is rejected up front.
//!
//! # Reserved keys
//!
//! The [`keys`] module holds the value keys the engine claims for itself
//! inside every attribute store. User keys must not collide with them.
//!
//! # Examples
//!
//! ```
//! use keepsake::core::types::{CapsuleId, ReferenceId};
//!
//! let capsule = CapsuleId::new("player").unwrap();
//! assert_eq!(capsule.as_str(), "player");
//! assert!(CapsuleId::new("a/b").is_err());
//!
//! let root = ReferenceId::root();
//! assert!(root.is_root());
//! assert!(!ReferenceId::from_counter(0).is_root());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Reserved value keys.
///
/// These keys carry engine bookkeeping inside otherwise user-owned attribute
/// stores: the type stamp pair written on every saved reference, the amnesty
/// list of value keys to retain across saves, and the migration cursor.
pub mod keys {
    /// Value key holding the saved reference's fully qualified type name.
    ///
    /// Legacy fallback for type resolution; the numeric type id is preferred.
    pub const REFERENCE_TYPE_NAME: &str = "RESERVED_REFERENCE_TYPE_FULL_NAME_STRING_RESERVED";

    /// Value key holding the saved reference's registry type id.
    pub const REFERENCE_TYPE_ID: &str = "RESERVED_REFERENCE_TYPE_ID_ULONG_RESERVED";

    /// Value key holding the amnesty list: value keys retained across a save
    /// pass even when the pass did not rewrite them.
    pub const VALUE_KEYS_TO_KEEP: &str = "RESERVED_VALUE_KEYS_TO_KEEP_KEY_RESERVED";

    /// Value key holding the migration cursor in a capsule's root store.
    pub const MIGRATOR_INDEX: &str = "RESERVED_MIGRATOR_INDEX_KEY_RESERVED";

    /// Check whether a value key is reserved for engine bookkeeping.
    pub fn is_reserved(key: &str) -> bool {
        matches!(
            key,
            REFERENCE_TYPE_NAME | REFERENCE_TYPE_ID | VALUE_KEYS_TO_KEEP | MIGRATOR_INDEX
        )
    }
}

/// Reference identity of every capsule's root store.
pub const ROOT_REFERENCE_ID: &str = "ID_CAPSULE_SAVE_DATA";

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid capsule id: {0}")]
    InvalidCapsuleId(String),

    #[error("invalid reference id: {0}")]
    InvalidReferenceId(String),
}

/// A validated capsule identifier.
///
/// Capsule ids are stable strings chosen by the application. Each capsule is
/// persisted to `<root>/<id>.<ext>`, so the id must be a safe single path
/// component:
/// - Cannot be empty
/// - Cannot contain `/`, `\`, or ASCII control characters
/// - Cannot be `.` or `..`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapsuleId(String);

impl CapsuleId {
    /// Create a new validated capsule id.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidCapsuleId` if the id is empty or not a safe
    /// path component.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    fn validate(id: &str) -> Result<(), TypeError> {
        if id.is_empty() {
            return Err(TypeError::InvalidCapsuleId(
                "capsule id cannot be empty".into(),
            ));
        }
        if id == "." || id == ".." {
            return Err(TypeError::InvalidCapsuleId(format!(
                "capsule id cannot be '{}'",
                id
            )));
        }
        if id.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
            return Err(TypeError::InvalidCapsuleId(
                "capsule id cannot contain path separators or control characters".into(),
            ));
        }
        Ok(())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapsuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CapsuleId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CapsuleId> for String {
    fn from(value: CapsuleId) -> Self {
        value.0
    }
}

/// A reference identity within persisted storage.
///
/// Identities are allocated monotonically from a counter during a save pass
/// and are unique only within that pass. The distinguished root identity
/// ([`ROOT_REFERENCE_ID`]) names the capsule's own store. An identity stays
/// stable across save/load cycles as long as its object remains reachable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceId(String);

impl ReferenceId {
    /// The root identity shared by every capsule's own store.
    pub fn root() -> Self {
        Self(ROOT_REFERENCE_ID.to_string())
    }

    /// Identity for the given allocation counter value.
    pub fn from_counter(counter: u64) -> Self {
        Self(counter.to_string())
    }

    /// Parse an identity from persisted text.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidReferenceId` for empty input; anything else
    /// round-trips verbatim (old files may carry identities this build never
    /// allocates, such as editor-minted uuids).
    pub fn parse(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TypeError::InvalidReferenceId(
                "reference id cannot be empty".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Whether this is the distinguished root identity.
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_REFERENCE_ID
    }

    /// Get the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sort key placing the root first, then counter identities in numeric
    /// order, then everything else lexically. Used for deterministic envelope
    /// output.
    pub(crate) fn sort_key(&self) -> (u8, u64, &str) {
        if self.is_root() {
            (0, 0, "")
        } else if let Ok(n) = self.0.parse::<u64>() {
            (1, n, "")
        } else {
            (2, 0, self.0.as_str())
        }
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capsule_id_accepts_simple_names() {
        assert!(CapsuleId::new("player").is_ok());
        assert!(CapsuleId::new("world-state_2").is_ok());
    }

    #[test]
    fn capsule_id_rejects_unsafe_names() {
        assert!(CapsuleId::new("").is_err());
        assert!(CapsuleId::new(".").is_err());
        assert!(CapsuleId::new("..").is_err());
        assert!(CapsuleId::new("a/b").is_err());
        assert!(CapsuleId::new("a\\b").is_err());
        assert!(CapsuleId::new("a\nb").is_err());
    }

    #[test]
    fn reference_id_root_roundtrip() {
        let root = ReferenceId::root();
        assert!(root.is_root());
        assert_eq!(root.as_str(), ROOT_REFERENCE_ID);
        assert_eq!(ReferenceId::parse(ROOT_REFERENCE_ID).unwrap(), root);
    }

    #[test]
    fn reference_id_sort_order_is_numeric_for_counters() {
        let mut ids = vec![
            ReferenceId::from_counter(10),
            ReferenceId::root(),
            ReferenceId::from_counter(2),
            ReferenceId::parse("zzz-uuid").unwrap(),
        ];
        ids.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        assert!(ids[0].is_root());
        assert_eq!(ids[1].as_str(), "2");
        assert_eq!(ids[2].as_str(), "10");
        assert_eq!(ids[3].as_str(), "zzz-uuid");
    }

    #[test]
    fn reserved_keys_are_detected() {
        assert!(keys::is_reserved(keys::REFERENCE_TYPE_NAME));
        assert!(keys::is_reserved(keys::REFERENCE_TYPE_ID));
        assert!(keys::is_reserved(keys::VALUE_KEYS_TO_KEEP));
        assert!(keys::is_reserved(keys::MIGRATOR_INDEX));
        assert!(!keys::is_reserved("level"));
    }
}
