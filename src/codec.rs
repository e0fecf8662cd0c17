//! Envelope serialization and content-derived message ids.
//!
//! Encoding is canonical: struct fields serialize in declaration order and
//! object keys inside free-form values are sorted, so the same business
//! fields always produce the same bytes and therefore the same digest.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    errors::DecodeError,
    models::message::{BusinessFields, NotificationEnvelope},
};

pub fn encode(envelope: &NotificationEnvelope) -> Result<Vec<u8>, serde_json::Error> {
    let canonical = NotificationEnvelope {
        recipient: sorted_keys(&envelope.recipient),
        content: sorted_keys(&envelope.content),
        ..envelope.clone()
    };

    serde_json::to_vec(&canonical)
}

pub fn decode(payload: &[u8]) -> Result<NotificationEnvelope, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Lowercase hex SHA-256 over the canonical encoding of the business fields.
pub fn compute_message_id(fields: &BusinessFields<'_>) -> Result<String, serde_json::Error> {
    let recipient = sorted_keys(fields.recipient);
    let content = sorted_keys(fields.content);
    let canonical = serde_json::to_vec(&BusinessFields {
        recipient: &recipient,
        content: &content,
        ..*fields
    })?;
    let digest = Sha256::digest(&canonical);

    Ok(hex::encode(digest))
}

fn sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), sorted_keys(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_keys).collect()),
        other => other.clone(),
    }
}
