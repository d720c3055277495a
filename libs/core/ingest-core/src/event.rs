//! Wire record consumed from the source log and the decoded `Event` it carries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A raw message pulled from the durable log, before decoding.
///
/// `partition` and `offset` identify the message's position for commit
/// purposes; `value` is the opaque payload expected to decode as an
/// [`Event`].
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// The decoded event carried in a `LogRecord`'s value.
///
/// `payload` is never inspected by the core; it is preserved verbatim for
/// storage and, if the record is dead-lettered, for forensic replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
}

/// Why a raw record's value could not be turned into a valid [`Event`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("value is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("event_id is missing or empty")]
    MissingEventId,
    #[error("event_id is not a valid UUID: {0}")]
    InvalidEventId(String),
    #[error("event_type is missing or empty")]
    MissingEventType,
}

/// Decode and validate a raw log value as an [`Event`].
///
/// Decoding failure (not parseable JSON) and validation failure (missing
/// `event_id`/`event_type`, or an `event_id` that is not a valid UUID) are
/// both poison-pill conditions: they are evaluated before any store
/// attempt and are always terminal.
pub fn decode_event(value: &[u8]) -> Result<Event, DecodeError> {
    let event: Event =
        serde_json::from_slice(value).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    validate_event(&event)?;
    Ok(event)
}

fn validate_event(event: &Event) -> Result<(), DecodeError> {
    if event.event_id.is_empty() {
        return Err(DecodeError::MissingEventId);
    }
    Uuid::parse_str(&event.event_id)
        .map_err(|e| DecodeError::InvalidEventId(e.to_string()))?;
    if event.event_type.is_empty() {
        return Err(DecodeError::MissingEventType);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_formed_event() {
        let value = br#"{"event_id":"3f1b6f0a-6e21-4f1e-8a7e-1f9c9a6f0a10","event_type":"purchase","payload":{"amount":99}}"#;
        let event = decode_event(value).unwrap();
        assert_eq!(event.event_type, "purchase");
    }

    #[test]
    fn rejects_invalid_json() {
        let value = b"{not-valid-json!!!}";
        assert!(matches!(decode_event(value), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn rejects_empty_event_id() {
        let value = br#"{"event_id":"","event_type":"click","payload":{}}"#;
        assert!(matches!(decode_event(value), Err(DecodeError::MissingEventId)));
    }

    #[test]
    fn rejects_non_uuid_event_id() {
        let value = br#"{"event_id":"not-a-uuid","event_type":"click","payload":{}}"#;
        assert!(matches!(decode_event(value), Err(DecodeError::InvalidEventId(_))));
    }

    #[test]
    fn rejects_missing_event_type() {
        let value = br#"{"event_id":"3f1b6f0a-6e21-4f1e-8a7e-1f9c9a6f0a10","event_type":"","payload":{}}"#;
        assert!(matches!(decode_event(value), Err(DecodeError::MissingEventType)));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let value = br#"{"event_id":"3f1b6f0a-6e21-4f1e-8a7e-1f9c9a6f0a10","event_type":"click","payload":{},"unexpected":"field"}"#;
        assert!(decode_event(value).is_ok());
    }
}
