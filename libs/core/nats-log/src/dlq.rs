//! The dead-letter log: publishes [`DlqEnvelope`]s onto a JetStream stream.

use std::time::Duration;

use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::Context;
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use ingest_core::{CancelSignal, DeadLetterLog, DlqEnvelope, LogError};
use tracing::{debug, info};

use crate::config::NatsStreamConfig;
use crate::error::NatsError;

#[derive(Clone)]
pub struct NatsDeadLetterLog {
    client: Client,
    jetstream: Context,
    dlq_stream: String,
    dlq_subject: String,
}

impl NatsDeadLetterLog {
    /// Connect, ensuring the DLQ stream exists.
    pub async fn connect(
        client: Client,
        jetstream: Context,
        config: &NatsStreamConfig,
    ) -> Result<Self, NatsError> {
        let log = Self {
            client,
            jetstream,
            dlq_stream: config.dlq_stream.clone(),
            dlq_subject: config.dlq_subject.clone(),
        };
        log.ensure_stream().await?;
        Ok(log)
    }

    async fn ensure_stream(&self) -> Result<(), NatsError> {
        match self.jetstream.get_stream(&self.dlq_stream).await {
            Ok(_) => {
                debug!(stream = %self.dlq_stream, "DLQ stream already exists");
                Ok(())
            }
            Err(_) => {
                info!(stream = %self.dlq_stream, subject = %self.dlq_subject, "creating DLQ stream");
                self.jetstream
                    .create_stream(StreamConfig {
                        name: self.dlq_stream.clone(),
                        subjects: vec![self.dlq_subject.clone()],
                        max_messages: 10_000,
                        max_age: Duration::from_secs(30 * 24 * 60 * 60),
                        ..Default::default()
                    })
                    .await
                    .map_err(NatsError::from_jetstream_error)?;
                Ok(())
            }
        }
    }

    async fn publish(&self, envelope: &DlqEnvelope) -> Result<(), NatsError> {
        let payload = serde_json::to_vec(envelope)?;

        let mut headers = HeaderMap::new();
        for (name, value) in envelope.headers() {
            headers.insert(name, value);
        }

        let ack = self
            .jetstream
            .publish_with_headers(self.dlq_subject.clone(), headers, payload.into())
            .await
            .map_err(|e| NatsError::publish_error(e.to_string()))?;

        ack.await.map_err(|e| NatsError::publish_error(e.to_string()))?;

        info!(
            topic = %envelope.original_topic,
            partition = envelope.original_partition,
            offset = envelope.original_offset,
            kind = %envelope.error_kind,
            "dead-lettered record"
        );

        Ok(())
    }
}

#[async_trait]
impl DeadLetterLog for NatsDeadLetterLog {
    async fn send(&self, envelope: &DlqEnvelope, cancel: &mut CancelSignal) -> Result<(), LogError> {
        if *cancel.borrow() {
            return Err(LogError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.changed() => Err(LogError::Cancelled),
            result = self.publish(envelope) => result.map_err(LogError::from),
        }
    }

    async fn close(&self) -> Result<(), LogError> {
        self.client
            .flush()
            .await
            .map_err(|e| LogError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::{ErrorKind, LogRecord};

    fn sample_record() -> LogRecord {
        LogRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset: 42,
            key: None,
            value: b"payload".to_vec(),
            headers: vec![],
        }
    }

    #[test]
    fn envelope_headers_carry_reason_and_original_topic() {
        let record = sample_record();
        let envelope = DlqEnvelope::new(&record, "decode failure".to_string(), ErrorKind::Permanent, 0);
        let headers = envelope.headers();

        assert!(headers
            .iter()
            .any(|(k, _)| k == ingest_core::HEADER_DLQ_REASON));
        assert!(headers
            .iter()
            .any(|(k, v)| k == ingest_core::HEADER_ORIGINAL_TOPIC && v == "orders"));
    }

    #[tokio::test]
    #[ignore] // requires Docker
    async fn publish_lands_on_the_dlq_stream() {
        let nats = test_utils::TestNats::new().await;
        let jetstream = nats.jetstream();

        let config = NatsStreamConfig::default()
            .with_dlq_stream("TEST_DLQ")
            .with_dlq_subject("test.dlq");

        let log = NatsDeadLetterLog::connect(nats.client(), jetstream.clone(), &config)
            .await
            .unwrap();

        let record = sample_record();
        let envelope = DlqEnvelope::new(&record, "boom".to_string(), ErrorKind::Permanent, 2);
        let (_tx, mut cancel) = tokio::sync::watch::channel(false);
        log.send(&envelope, &mut cancel).await.unwrap();

        let mut stream = jetstream.get_stream("TEST_DLQ").await.unwrap();
        let info = stream.info().await.unwrap();
        assert_eq!(info.state.messages, 1);
    }
}
