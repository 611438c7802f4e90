//! storage::envelope
//!
//! On-disk wire format for one capsule.
//!
//! A save file is an outer JSON wrapper holding the (optionally encoded)
//! envelope text plus an integrity token. The token is the hex SHA-256 of
//! the encoded text concatenated with the plain text, itself passed
//! through the active encoding; a file whose token does not re-derive is
//! rejected as tampered or truncated. The inner envelope lists every
//! reference of the capsule with its value and reference channels.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::core::section::ValueSection;
use crate::core::store::AttributeStore;
use crate::core::types::{CapsuleId, ReferenceId};

/// Errors from sealing or opening a save file.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Wrapper or envelope JSON failed to (de)serialize.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Envelope text failed to decode under the configured encoding.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    /// Decoded envelope text is not valid UTF-8.
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Stored integrity token does not match the file content.
    #[error("integrity token mismatch; file is corrupt or was edited")]
    IntegrityMismatch,
}

/// Transport encoding applied to envelope text inside the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Encoding {
    /// Envelope text stored as-is.
    #[default]
    None,
    /// Envelope text stored base64-encoded.
    Base64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveFileWrapper {
    save_file_password: String,
    safe_file_text: String,
}

/// One capsule's persisted content.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveEnvelope {
    pub capsule_id: String,
    pub references_save_data: Vec<ReferenceSaveData>,
}

/// One reference's persisted channels.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSaveData {
    pub reference_id: String,
    pub value_data_items: Vec<ValueDataItem>,
    pub reference_data_items: Vec<RefDataItem>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueDataItem {
    pub key: String,
    pub value_section: ValueSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefDataItem {
    pub key: String,
    pub value: String,
}

impl SaveEnvelope {
    /// Build an envelope from a capsule's stores, ordered root-first then
    /// by identity.
    pub fn build(capsule_id: &CapsuleId, stores: &BTreeMap<ReferenceId, AttributeStore>) -> Self {
        let mut ordered: Vec<_> = stores.iter().collect();
        ordered.sort_by(|(a, _), (b, _)| a.sort_key().cmp(&b.sort_key()));

        let references_save_data = ordered
            .into_iter()
            .map(|(id, store)| ReferenceSaveData {
                reference_id: id.to_string(),
                value_data_items: store
                    .values_iter()
                    .map(|(key, section)| ValueDataItem {
                        key: key.to_string(),
                        value_section: section.clone(),
                    })
                    .collect(),
                reference_data_items: store
                    .references_iter()
                    .map(|(key, value)| RefDataItem {
                        key: key.to_string(),
                        value: value.to_string(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            capsule_id: capsule_id.to_string(),
            references_save_data,
        }
    }

    /// Rebuild per-identity stores. Entries with an unusable identity are
    /// logged and skipped rather than failing the whole capsule.
    pub fn into_stores(self, capsule_id: &CapsuleId) -> BTreeMap<ReferenceId, AttributeStore> {
        let mut stores = BTreeMap::new();
        for entry in self.references_save_data {
            let id = match ReferenceId::parse(entry.reference_id.clone()) {
                Ok(id) => id,
                Err(err) => {
                    warn!(
                        capsule = %capsule_id,
                        reference = entry.reference_id,
                        error = %err,
                        "skipping entry with unusable reference id"
                    );
                    continue;
                }
            };
            let values: BTreeMap<String, ValueSection> = entry
                .value_data_items
                .into_iter()
                .map(|item| (item.key, item.value_section))
                .collect();
            let references: BTreeMap<String, String> = entry
                .reference_data_items
                .into_iter()
                .map(|item| (item.key, item.value))
                .collect();
            stores.insert(
                id,
                AttributeStore::from_parts(capsule_id.clone(), values, references),
            );
        }
        stores
    }
}

fn encode_text(text: &str, encoding: Encoding) -> String {
    match encoding {
        Encoding::None => text.to_string(),
        Encoding::Base64 => BASE64.encode(text.as_bytes()),
    }
}

fn decode_text(text: &str, encoding: Encoding) -> Result<String, EnvelopeError> {
    match encoding {
        Encoding::None => Ok(text.to_string()),
        Encoding::Base64 => Ok(String::from_utf8(BASE64.decode(text)?)?),
    }
}

fn integrity_token(encoded_text: &str, plain_text: &str, encoding: Encoding) -> String {
    let mut hasher = Sha256::new();
    hasher.update(encoded_text.as_bytes());
    hasher.update(plain_text.as_bytes());
    encode_text(&hex::encode(hasher.finalize()), encoding)
}

/// Serialize an envelope into final file text.
///
/// # Errors
///
/// Envelope or wrapper serialization failure.
pub fn seal(envelope: &SaveEnvelope, encoding: Encoding) -> Result<String, EnvelopeError> {
    let plain = serde_json::to_string(envelope)?;
    let encoded = encode_text(&plain, encoding);
    let wrapper = SaveFileWrapper {
        save_file_password: integrity_token(&encoded, &plain, encoding),
        safe_file_text: encoded,
    };
    Ok(serde_json::to_string(&wrapper)?)
}

/// Parse file text back into an envelope, verifying the integrity token.
///
/// # Errors
///
/// Malformed wrapper or envelope JSON, decode failure, or
/// `EnvelopeError::IntegrityMismatch`.
pub fn open(file_text: &str, encoding: Encoding) -> Result<SaveEnvelope, EnvelopeError> {
    let wrapper: SaveFileWrapper = serde_json::from_str(file_text)?;
    let plain = decode_text(&wrapper.safe_file_text, encoding)?;
    let expected = integrity_token(&wrapper.safe_file_text, &plain, encoding);
    if wrapper.save_file_password != expected {
        return Err(EnvelopeError::IntegrityMismatch);
    }
    Ok(serde_json::from_str(&plain)?)
}
