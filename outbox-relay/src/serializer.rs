//! Serializer (C2): turns an outbox row into the wire-format byte payload
//! plus a routing key and header map.
//!
//! Wire format: schema-registry framed binary — a 1-byte magic (`0x00`), a
//! 4-byte big-endian schema id, then a record whose first field is the
//! row's 64-bit `id` so the consumer can recover it by reading 8 bytes
//! after the 5-byte prefix, followed by the JSON-encoded remaining fields.

use crate::error::{RelayError, RelayResult};
use crate::model::OutboxRow;
use std::collections::HashMap;

const MAGIC_BYTE: u8 = 0x00;

#[derive(Debug, Clone, Default)]
pub struct HeaderMap(pub HashMap<String, String>);

impl HeaderMap {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

pub trait Serializer: Send + Sync {
    fn serialize(&self, row: &OutboxRow) -> RelayResult<(String, HeaderMap, Vec<u8>)>;
}

/// Concrete serializer. The schema id is pre-resolved by the caller — the
/// schema registry round trip itself is an external collaborator.
pub struct SchemaRegistryFramedSerializer {
    schema_id: u32,
}

impl SchemaRegistryFramedSerializer {
    pub fn new(schema_id: u32) -> Self {
        Self { schema_id }
    }
}

impl Serializer for SchemaRegistryFramedSerializer {
    fn serialize(&self, row: &OutboxRow) -> RelayResult<(String, HeaderMap, Vec<u8>)> {
        let mut buf = Vec::with_capacity(13 + 64);
        buf.push(MAGIC_BYTE);
        buf.extend_from_slice(&self.schema_id.to_be_bytes());
        buf.extend_from_slice(&row.id.to_be_bytes());

        let remainder = serde_json::json!({
            "routing_key": row.routing_key,
            "event_type": row.event_type,
            "payload": row.payload,
        });
        let remainder_bytes =
            serde_json::to_vec(&remainder).map_err(|source| RelayError::SerializationError {
                row_id: row.id,
                source,
            })?;
        buf.extend_from_slice(&remainder_bytes);

        let mut headers = HeaderMap::default();
        headers.insert("event-type", row.event_type.clone());

        Ok((row.routing_key.clone(), headers, buf))
    }
}

/// Recover the row id from a wire-format value (used by the consumer
/// pipeline, C9).
pub fn extract_row_id(value: &[u8]) -> RelayResult<i64> {
    if value.len() < 13 || value[0] != MAGIC_BYTE {
        return Err(RelayError::Other(anyhow::anyhow!(
            "malformed wire value: missing magic byte or too short"
        )));
    }
    let id_bytes: [u8; 8] = value[5..13]
        .try_into()
        .expect("slice of length 8 converts to [u8; 8]");
    Ok(i64::from_be_bytes(id_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_row() -> OutboxRow {
        OutboxRow {
            id: 42,
            routing_key: "order-123".to_string(),
            event_type: "order.created".to_string(),
            payload: serde_json::json!({ "amount": 100 }),
            publish_flag: false,
            processed_flag: true,
            produced_at: None,
            received_at: None,
            retry_count: 0,
            error_code: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn serialize_is_deterministic() {
        let serializer = SchemaRegistryFramedSerializer::new(7);
        let row = sample_row();
        let (key_a, _, bytes_a) = serializer.serialize(&row).unwrap();
        let (key_b, _, bytes_b) = serializer.serialize(&row).unwrap();
        assert_eq!(key_a, key_b);
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn serialize_and_extract_round_trip_the_row_id() {
        let serializer = SchemaRegistryFramedSerializer::new(7);
        let row = sample_row();
        let (_, _, bytes) = serializer.serialize(&row).unwrap();

        assert_eq!(bytes[0], MAGIC_BYTE);
        assert_eq!(extract_row_id(&bytes).unwrap(), 42);
    }

    #[test]
    fn extract_row_id_rejects_short_values() {
        assert!(extract_row_id(&[0x00, 0x00]).is_err());
    }
}
