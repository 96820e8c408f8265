//! Ingested records and their stored form

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Prefix applied to record ids to form their store key
pub const STORED_KEY_PREFIX: &str = "post_";

/// A record fetched from a source.
///
/// Identity is the id alone; the payload is whatever the source returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Source-assigned identifier
    pub id: String,
    /// Source payload, stored verbatim apart from the id field
    pub payload: Value,
}

/// Why a record could not be turned into a stored value.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Record has an empty id
    #[error("record id is empty")]
    EmptyId,

    /// JSON encoding failed
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl Record {
    /// Record with an object payload holding only the id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut payload = Map::new();
        payload.insert("id".to_string(), Value::String(id.clone()));
        Self {
            id,
            payload: Value::Object(payload),
        }
    }

    /// Record carrying an arbitrary payload.
    pub fn with_payload(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Key under which this record is stored.
    pub fn stored_key(&self) -> String {
        format!("{}{}", STORED_KEY_PREFIX, self.id)
    }

    /// Serializes the stored value.
    ///
    /// Object payloads are stored with their `id` replaced by the stored
    /// key; any other payload is wrapped as `{"id": ..., "payload": ...}`.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        if self.id.is_empty() {
            return Err(RecordError::EmptyId);
        }

        let stored_id = Value::String(self.stored_key());
        let value = match &self.payload {
            Value::Object(fields) => {
                let mut fields = fields.clone();
                fields.insert("id".to_string(), stored_id);
                Value::Object(fields)
            }
            other => {
                let mut fields = Map::new();
                fields.insert("id".to_string(), stored_id);
                fields.insert("payload".to_string(), other.clone());
                Value::Object(fields)
            }
        };
        Ok(serde_json::to_vec(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stored_key() {
        assert_eq!(Record::new("abc").stored_key(), "post_abc");
    }

    #[test]
    fn test_encode_rewrites_id() {
        let record = Record::with_payload("p1", json!({"id": "p1", "title": "hello"}));
        let stored: Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(stored, json!({"id": "post_p1", "title": "hello"}));
    }

    #[test]
    fn test_encode_wraps_scalar_payload() {
        let record = Record::with_payload("p2", json!("just text"));
        let stored: Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(stored, json!({"id": "post_p2", "payload": "just text"}));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let record = Record::with_payload("p3", json!({"b": 1, "a": [1, 2]}));
        assert_eq!(record.encode().unwrap(), record.encode().unwrap());
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(matches!(
            Record::new("").encode(),
            Err(RecordError::EmptyId)
        ));
    }
}
