//! core::section
//!
//! Self-describing value sections and their type tags.
//!
//! # Architecture
//!
//! Every stored value travels as a [`ValueSection`]: a `(type tag, encoded
//! payload)` pair. The tag names the value's live type; the payload is the
//! JSON encoding of the value itself. Arrays and dictionaries nest by making
//! the payload a sequence of further sections, so the same abstraction
//! applies recursively and every element carries its own tag.
//!
//! # Failure policy
//!
//! Decoding fails *softly*. A tag that no longer resolves (a renamed or
//! removed type) makes that one section unreadable; callers log it and move
//! on; it is never fatal to the surrounding store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from section encoding and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Section's tag does not match the requested type.
    ///
    /// This is what a renamed or removed type looks like at read time: the
    /// persisted tag no longer resolves to the type being asked for.
    #[error("section tagged '{found}' does not resolve to '{requested}'")]
    TagMismatch {
        /// Tag recorded in the section.
        found: String,
        /// Tag of the requested type.
        requested: String,
    },

    /// Section has no tag at all (empty `valueType`).
    #[error("section has an empty type tag")]
    MissingTag,

    /// Payload failed to parse as the tagged type.
    #[error("malformed payload for tag '{tag}': {source}")]
    Malformed {
        /// Tag recorded in the section.
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    /// Value could not be encoded to JSON.
    #[error("failed to encode value for tag '{tag}': {source}")]
    Encode {
        /// Tag of the value being encoded.
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The closed set of built-in type tags, plus an open escape for
/// application-defined value types.
///
/// Built-in tags are spelled like the Rust types they describe. Custom tags
/// should be fully qualified (`"mygame::Stats"`) so renames are visible in
/// persisted data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Char,
    String,
    /// Heterogeneous sequence of nested sections.
    Array,
    /// Heterogeneous key/value sequence of nested section pairs.
    Dict,
    /// Application-defined value type, identified by its qualified name.
    Custom(std::string::String),
}

impl TypeTag {
    /// Whether this tag is one of the built-in scalar tags (not a wrapper,
    /// not custom).
    pub fn is_scalar(&self) -> bool {
        !matches!(self, TypeTag::Array | TypeTag::Dict | TypeTag::Custom(_))
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeTag::Bool => "bool",
            TypeTag::I8 => "i8",
            TypeTag::I16 => "i16",
            TypeTag::I32 => "i32",
            TypeTag::I64 => "i64",
            TypeTag::U8 => "u8",
            TypeTag::U16 => "u16",
            TypeTag::U32 => "u32",
            TypeTag::U64 => "u64",
            TypeTag::F32 => "f32",
            TypeTag::F64 => "f64",
            TypeTag::Char => "char",
            TypeTag::String => "string",
            TypeTag::Array => "keepsake::Array",
            TypeTag::Dict => "keepsake::Dict",
            TypeTag::Custom(name) => name,
        };
        f.write_str(s)
    }
}

impl FromStr for TypeTag {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" => return Err(CodecError::MissingTag),
            "bool" => TypeTag::Bool,
            "i8" => TypeTag::I8,
            "i16" => TypeTag::I16,
            "i32" => TypeTag::I32,
            "i64" => TypeTag::I64,
            "u8" => TypeTag::U8,
            "u16" => TypeTag::U16,
            "u32" => TypeTag::U32,
            "u64" => TypeTag::U64,
            "f32" => TypeTag::F32,
            "f64" => TypeTag::F64,
            "char" => TypeTag::Char,
            "string" => TypeTag::String,
            "keepsake::Array" => TypeTag::Array,
            "keepsake::Dict" => TypeTag::Dict,
            other => TypeTag::Custom(other.to_string()),
        })
    }
}

/// One stored value: a type tag plus its JSON-encoded payload.
///
/// The wire field names (`valueString` / `valueType`) match the persisted
/// envelope format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSection {
    /// JSON encoding of the value.
    pub value_string: String,
    /// Type tag string; see [`TypeTag`].
    pub value_type: String,
}

impl ValueSection {
    /// Build a section from a tag and an already-encoded payload.
    pub fn new(tag: TypeTag, payload: String) -> Self {
        Self {
            value_string: payload,
            value_type: tag.to_string(),
        }
    }

    /// A section is valid when it carries a non-empty type tag.
    pub fn is_valid(&self) -> bool {
        !self.value_type.is_empty()
    }

    /// Parse the section's type tag.
    ///
    /// # Errors
    ///
    /// `CodecError::MissingTag` for an empty tag.
    pub fn type_tag(&self) -> Result<TypeTag, CodecError> {
        self.value_type.parse()
    }

    /// Decode the payload without static type knowledge.
    ///
    /// Used by inspection and validation, which must walk stores whose value
    /// types no longer exist (or never existed in this binary).
    ///
    /// # Errors
    ///
    /// Soft failures only: missing tag or a payload that does not parse as
    /// the tagged shape.
    pub fn decode_dyn(&self) -> Result<DynValue, CodecError> {
        let tag = self.type_tag()?;
        let malformed = |source| CodecError::Malformed {
            tag: self.value_type.clone(),
            source,
        };
        Ok(match tag {
            TypeTag::Bool => DynValue::Bool(
                serde_json::from_str(&self.value_string).map_err(malformed)?,
            ),
            TypeTag::I8 | TypeTag::I16 | TypeTag::I32 | TypeTag::I64 => DynValue::Int(
                serde_json::from_str(&self.value_string).map_err(malformed)?,
            ),
            TypeTag::U8 | TypeTag::U16 | TypeTag::U32 | TypeTag::U64 => DynValue::UInt(
                serde_json::from_str(&self.value_string).map_err(malformed)?,
            ),
            TypeTag::F32 | TypeTag::F64 => DynValue::Float(
                serde_json::from_str(&self.value_string).map_err(malformed)?,
            ),
            TypeTag::Char => DynValue::Char(
                serde_json::from_str(&self.value_string).map_err(malformed)?,
            ),
            TypeTag::String => DynValue::Str(
                serde_json::from_str(&self.value_string).map_err(malformed)?,
            ),
            TypeTag::Array => DynValue::Array(
                serde_json::from_str(&self.value_string).map_err(malformed)?,
            ),
            TypeTag::Dict => DynValue::Dict(
                serde_json::from_str(&self.value_string).map_err(malformed)?,
            ),
            TypeTag::Custom(_) => DynValue::Other(
                serde_json::from_str(&self.value_string).map_err(malformed)?,
            ),
        })
    }
}

/// An entry of a dictionary section: key and value are both full sections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictEntry {
    pub key: ValueSection,
    pub value: ValueSection,
}

/// Dynamically decoded view of a section, for tooling that has no static
/// type to decode into.
#[derive(Debug, Clone, PartialEq)]
pub enum DynValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Char(char),
    Str(String),
    /// Nested sections; each element still carries its own tag.
    Array(Vec<ValueSection>),
    /// Nested key/value section pairs.
    Dict(Vec<DictEntry>),
    /// Custom-tagged payload, surfaced as raw JSON.
    Other(serde_json::Value),
}

impl fmt::Display for DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynValue::Bool(v) => write!(f, "{}", v),
            DynValue::Int(v) => write!(f, "{}", v),
            DynValue::UInt(v) => write!(f, "{}", v),
            DynValue::Float(v) => write!(f, "{}", v),
            DynValue::Char(v) => write!(f, "{:?}", v),
            DynValue::Str(v) => write!(f, "{:?}", v),
            DynValue::Array(items) => write!(f, "[{} items]", items.len()),
            DynValue::Dict(items) => write!(f, "{{{} entries}}", items.len()),
            DynValue::Other(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip_through_display() {
        for tag in [
            TypeTag::Bool,
            TypeTag::I32,
            TypeTag::U64,
            TypeTag::F64,
            TypeTag::Char,
            TypeTag::String,
            TypeTag::Array,
            TypeTag::Dict,
            TypeTag::Custom("mygame::Stats".into()),
        ] {
            let parsed: TypeTag = tag.to_string().parse().unwrap();
            assert_eq!(parsed, tag);
        }
    }

    #[test]
    fn empty_tag_is_invalid() {
        let section = ValueSection {
            value_string: "3".into(),
            value_type: "".into(),
        };
        assert!(!section.is_valid());
        assert!(matches!(section.type_tag(), Err(CodecError::MissingTag)));
    }

    #[test]
    fn dyn_decode_scalars() {
        let section = ValueSection::new(TypeTag::I32, "42".into());
        assert_eq!(section.decode_dyn().unwrap(), DynValue::Int(42));

        let section = ValueSection::new(TypeTag::String, "\"hi\"".into());
        assert_eq!(section.decode_dyn().unwrap(), DynValue::Str("hi".into()));
    }

    #[test]
    fn dyn_decode_rejects_malformed_payload() {
        let section = ValueSection::new(TypeTag::I32, "not a number".into());
        assert!(matches!(
            section.decode_dyn(),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn unknown_tag_becomes_custom_and_decodes_as_json() {
        let section = ValueSection {
            value_string: "{\"hp\":10}".into(),
            value_type: "mygame::RemovedType".into(),
        };
        match section.decode_dyn().unwrap() {
            DynValue::Other(v) => assert_eq!(v["hp"], 10),
            other => panic!("expected Other, got {:?}", other),
        }
    }

    #[test]
    fn section_serializes_with_wire_field_names() {
        let section = ValueSection::new(TypeTag::I32, "3".into());
        let json = serde_json::to_string(&section).unwrap();
        assert!(json.contains("\"valueString\""));
        assert!(json.contains("\"valueType\""));
    }
}
