//! core::codec
//!
//! Typed encoding of values into sections.
//!
//! # Architecture
//!
//! [`StoreValue`] is the contract between application types and the stored
//! [`ValueSection`] form. It is implemented here for the built-in scalars and
//! for the two composable wrappers:
//!
//! - [`SaveableArray`] - a sequence of sections
//! - [`SaveableDict`] - a sequence of key/value section pairs
//!
//! Wrappers encode element-wise through the same contract recursively, and
//! every element carries its own tag, so a heterogeneous collection stays
//! decodable even when one element's type later disappears.
//!
//! # Values vs references
//!
//! Saveable objects must never travel the value channel. That rule is
//! enforced by construction: object handles do not implement [`StoreValue`],
//! so a disallowed declaration fails to compile rather than at
//! serialization time.
//!
//! # Custom types
//!
//! Application structs opt in with [`impl_store_value!`], which derives a
//! serde-backed implementation under an explicit qualified tag:
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use keepsake::impl_store_value;
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Stats { hp: u32, mana: u32 }
//!
//! impl_store_value!(Stats, "mygame::Stats");
//! ```

use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use super::section::{CodecError, DictEntry, TypeTag, ValueSection};

/// A value that can be stored through the value channel.
pub trait StoreValue: Sized {
    /// The tag recorded in persisted sections of this type.
    fn type_tag() -> TypeTag;

    /// Encode into a self-describing section.
    ///
    /// # Errors
    ///
    /// `CodecError::Encode` when the payload cannot be serialized.
    fn encode(&self) -> Result<ValueSection, CodecError>;

    /// Decode from a section.
    ///
    /// # Errors
    ///
    /// `CodecError::TagMismatch` when the section's tag does not resolve to
    /// this type; `CodecError::Malformed` when the payload does not parse.
    fn decode(section: &ValueSection) -> Result<Self, CodecError>;
}

/// Shared serde-backed encode for every implementation in this module.
fn encode_json<T: Serialize>(value: &T, tag: TypeTag) -> Result<ValueSection, CodecError> {
    let payload = serde_json::to_string(value).map_err(|source| CodecError::Encode {
        tag: tag.to_string(),
        source,
    })?;
    Ok(ValueSection::new(tag, payload))
}

/// Shared serde-backed decode with the tag check applied first.
fn decode_json<T: for<'de> Deserialize<'de>>(
    section: &ValueSection,
    tag: TypeTag,
) -> Result<T, CodecError> {
    let found = section.type_tag()?;
    if found != tag {
        return Err(CodecError::TagMismatch {
            found: section.value_type.clone(),
            requested: tag.to_string(),
        });
    }
    serde_json::from_str(&section.value_string).map_err(|source| CodecError::Malformed {
        tag: section.value_type.clone(),
        source,
    })
}

macro_rules! scalar_store_value {
    ($($ty:ty => $tag:expr),* $(,)?) => {
        $(
            impl StoreValue for $ty {
                fn type_tag() -> TypeTag {
                    $tag
                }

                fn encode(&self) -> Result<ValueSection, CodecError> {
                    encode_json(self, $tag)
                }

                fn decode(section: &ValueSection) -> Result<Self, CodecError> {
                    decode_json(section, $tag)
                }
            }
        )*
    };
}

scalar_store_value! {
    bool => TypeTag::Bool,
    i8 => TypeTag::I8,
    i16 => TypeTag::I16,
    i32 => TypeTag::I32,
    i64 => TypeTag::I64,
    u8 => TypeTag::U8,
    u16 => TypeTag::U16,
    u32 => TypeTag::U32,
    u64 => TypeTag::U64,
    f32 => TypeTag::F32,
    f64 => TypeTag::F64,
    char => TypeTag::Char,
    String => TypeTag::String,
}

/// Implement [`StoreValue`] for a serde-capable type under an explicit tag.
///
/// The tag should be qualified (`"crate::Type"`) so a rename shows up as an
/// unresolvable tag in old data instead of silently decoding into the wrong
/// shape.
#[macro_export]
macro_rules! impl_store_value {
    ($ty:ty, $tag:expr) => {
        impl $crate::core::codec::StoreValue for $ty {
            fn type_tag() -> $crate::core::section::TypeTag {
                $crate::core::section::TypeTag::Custom($tag.to_string())
            }

            fn encode(
                &self,
            ) -> Result<$crate::core::section::ValueSection, $crate::core::section::CodecError>
            {
                let tag = <Self as $crate::core::codec::StoreValue>::type_tag();
                let payload = serde_json::to_string(self).map_err(|source| {
                    $crate::core::section::CodecError::Encode {
                        tag: tag.to_string(),
                        source,
                    }
                })?;
                Ok($crate::core::section::ValueSection::new(tag, payload))
            }

            fn decode(
                section: &$crate::core::section::ValueSection,
            ) -> Result<Self, $crate::core::section::CodecError> {
                let tag = <Self as $crate::core::codec::StoreValue>::type_tag();
                let found = section.type_tag()?;
                if found != tag {
                    return Err($crate::core::section::CodecError::TagMismatch {
                        found: section.value_type.clone(),
                        requested: tag.to_string(),
                    });
                }
                serde_json::from_str(&section.value_string).map_err(|source| {
                    $crate::core::section::CodecError::Malformed {
                        tag: section.value_type.clone(),
                        source,
                    }
                })
            }
        }
    };
}

/// A stored sequence: every element is a full section with its own tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaveableArray {
    items: Vec<ValueSection>,
}

impl SaveableArray {
    /// Empty array.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a homogeneous slice element-wise.
    ///
    /// # Errors
    ///
    /// First element encode failure.
    pub fn from_values<T: StoreValue>(values: &[T]) -> Result<Self, CodecError> {
        let items = values.iter().map(T::encode).collect::<Result<_, _>>()?;
        Ok(Self { items })
    }

    /// Decode back into a homogeneous vector.
    ///
    /// # Errors
    ///
    /// First element that fails to decode as `T`. Use [`Self::sections`] to
    /// walk a heterogeneous array element by element instead.
    pub fn to_values<T: StoreValue>(&self) -> Result<Vec<T>, CodecError> {
        self.items.iter().map(T::decode).collect()
    }

    /// Append one element.
    ///
    /// # Errors
    ///
    /// Element encode failure.
    pub fn push<T: StoreValue>(&mut self, value: &T) -> Result<(), CodecError> {
        self.items.push(value.encode()?);
        Ok(())
    }

    /// Raw access to the element sections.
    pub fn sections(&self) -> &[ValueSection] {
        &self.items
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl StoreValue for SaveableArray {
    fn type_tag() -> TypeTag {
        TypeTag::Array
    }

    fn encode(&self) -> Result<ValueSection, CodecError> {
        encode_json(&self.items, TypeTag::Array)
    }

    fn decode(section: &ValueSection) -> Result<Self, CodecError> {
        Ok(Self {
            items: decode_json(section, TypeTag::Array)?,
        })
    }
}

/// A stored key/value map: keys and values are both full sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaveableDict {
    items: Vec<DictEntry>,
}

impl SaveableDict {
    /// Empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a map element-wise; entries are sorted by encoded key so the
    /// stored form is deterministic.
    ///
    /// # Errors
    ///
    /// First key or value encode failure.
    pub fn from_map<K, V>(map: &HashMap<K, V>) -> Result<Self, CodecError>
    where
        K: StoreValue,
        V: StoreValue,
    {
        let mut items = map
            .iter()
            .map(|(k, v)| {
                Ok(DictEntry {
                    key: k.encode()?,
                    value: v.encode()?,
                })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;
        items.sort_by(|a, b| a.key.value_string.cmp(&b.key.value_string));
        Ok(Self { items })
    }

    /// Decode back into a map.
    ///
    /// # Errors
    ///
    /// First entry whose key or value fails to decode. Use [`Self::entries`]
    /// to walk heterogeneous dictionaries entry by entry instead.
    pub fn to_map<K, V>(&self) -> Result<HashMap<K, V>, CodecError>
    where
        K: StoreValue + Eq + Hash,
        V: StoreValue,
    {
        self.items
            .iter()
            .map(|entry| Ok((K::decode(&entry.key)?, V::decode(&entry.value)?)))
            .collect()
    }

    /// Insert one entry.
    ///
    /// # Errors
    ///
    /// Key or value encode failure.
    pub fn insert<K: StoreValue, V: StoreValue>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<(), CodecError> {
        self.items.push(DictEntry {
            key: key.encode()?,
            value: value.encode()?,
        });
        Ok(())
    }

    /// Raw access to the entry sections.
    pub fn entries(&self) -> &[DictEntry] {
        &self.items
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl StoreValue for SaveableDict {
    fn type_tag() -> TypeTag {
        TypeTag::Dict
    }

    fn encode(&self) -> Result<ValueSection, CodecError> {
        encode_json(&self.items, TypeTag::Dict)
    }

    fn decode(section: &ValueSection) -> Result<Self, CodecError> {
        Ok(Self {
            items: decode_json(section, TypeTag::Dict)?,
        })
    }
}
