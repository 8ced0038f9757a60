//! Entity and index value serialization.

use std::collections::BTreeSet;

use tessera_core::{ChangeTracker, Key, MappedEntity, StoreError, TesseraResult};

/// Turns entities into stored bytes and back.
///
/// Decoded entities must come back marked as persisted so that later key
/// computations treat the stored state as the baseline.
pub trait EntitySerializer: Send + Sync {
    fn serialize<E: MappedEntity>(&self, key: &Key, entity: &E) -> TesseraResult<Vec<u8>>;

    fn deserialize<E: MappedEntity>(&self, key: &Key, bytes: &[u8]) -> TesseraResult<E>;
}

/// JSON via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl EntitySerializer for JsonSerializer {
    fn serialize<E: MappedEntity>(&self, key: &Key, entity: &E) -> TesseraResult<Vec<u8>> {
        serde_json::to_vec(entity).map_err(|e| {
            StoreError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn deserialize<E: MappedEntity>(&self, key: &Key, bytes: &[u8]) -> TesseraResult<E> {
        let mut entity: E =
            serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        *entity.tracker_mut() = ChangeTracker::loaded();
        Ok(entity)
    }
}

/// Encode a single key reference (unique index values).
pub fn encode_key(key: &Key) -> Vec<u8> {
    key.encode().into_bytes()
}

pub fn decode_key(at: &Key, bytes: &[u8]) -> TesseraResult<Key> {
    let text = std::str::from_utf8(bytes).map_err(|e| StoreError::Deserialization {
        key: at.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Key::decode(text)?)
}

/// Encode a set of keys (membership sets, integrity entries, cached
/// query results) as a JSON array of encoded keys.
pub fn encode_key_set<'a>(
    at: &Key,
    keys: impl IntoIterator<Item = &'a Key>,
) -> TesseraResult<Vec<u8>> {
    let encoded: Vec<String> = keys.into_iter().map(Key::encode).collect();
    serde_json::to_vec(&encoded).map_err(|e| {
        StoreError::Serialization {
            key: at.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

pub fn decode_key_set(at: &Key, bytes: &[u8]) -> TesseraResult<BTreeSet<Key>> {
    decode_key_list(at, bytes).map(|keys| keys.into_iter().collect())
}

/// Like [`decode_key_set`] but keeps stored order.
pub fn decode_key_list(at: &Key, bytes: &[u8]) -> TesseraResult<Vec<Key>> {
    let encoded: Vec<String> =
        serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization {
            key: at.to_string(),
            reason: e.to_string(),
        })?;
    encoded
        .iter()
        .map(|s| Key::decode(s).map_err(Into::into))
        .collect()
}
