//! The forensic envelope wrapping a failed record on its way to the
//! dead-letter log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::event::LogRecord;

/// Header carrying the classified reason a record was dead-lettered.
pub const HEADER_DLQ_REASON: &str = "dlq-reason";
/// Header carrying the name of the source log the record came from.
pub const HEADER_ORIGINAL_TOPIC: &str = "original-topic";

/// Forensic wrapper produced for every record that cannot be processed.
///
/// Field names are stable across versions; this is the wire contract
/// consumed by operator tooling and any future replay mechanism.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DlqEnvelope {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: u64,
    pub original_key: Option<String>,
    pub original_value: Vec<u8>,
    pub error_message: String,
    pub error_kind: String,
    /// Total store attempts made for the record, including the one that
    /// produced the fatal classification. Zero for decode/validation
    /// failures, which never reach the store.
    pub retries: u32,
    pub failed_at: DateTime<Utc>,
}

impl DlqEnvelope {
    pub fn new(record: &LogRecord, error_message: String, kind: ErrorKind, retries: u32) -> Self {
        Self {
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
            original_key: record.key.clone(),
            original_value: record.value.clone(),
            error_message,
            error_kind: kind.to_string(),
            retries,
            failed_at: Utc::now(),
        }
    }

    /// Headers carried alongside the serialized envelope body.
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            (HEADER_DLQ_REASON.to_string(), self.error_kind.clone()),
            (HEADER_ORIGINAL_TOPIC.to_string(), self.original_topic.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> LogRecord {
        LogRecord {
            topic: "events".to_string(),
            partition: 0,
            offset: 42,
            key: Some("k1".to_string()),
            value: vec![1, 2, 3, 4],
            headers: vec![],
        }
    }

    #[test]
    fn round_trips_through_json() {
        let record = sample_record();
        let envelope = DlqEnvelope::new(&record, "boom".to_string(), ErrorKind::Permanent, 1);

        let encoded = serde_json::to_vec(&envelope).unwrap();
        let decoded: DlqEnvelope = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.original_value, record.value);
    }

    #[test]
    fn headers_carry_reason_and_source_topic() {
        let record = sample_record();
        let envelope = DlqEnvelope::new(&record, "boom".to_string(), ErrorKind::Transient, 4);
        let headers = envelope.headers();

        assert!(headers.contains(&(HEADER_DLQ_REASON.to_string(), "transient".to_string())));
        assert!(headers.contains(&(HEADER_ORIGINAL_TOPIC.to_string(), "events".to_string())));
    }
}
