//! The source durable log: a NATS JetStream pull consumer bound to
//! [`ingest_core::DurableLog`].

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::{AckPolicy, Consumer};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{Context, Message};
use async_trait::async_trait;
use futures::StreamExt;
use ingest_core::{CancelSignal, DurableLog, LogError, LogRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::NatsStreamConfig;
use crate::error::NatsError;

/// Auto-commit is never used: [`commit_message`](DurableLog::commit_message)
/// is the only thing that acks a delivery.
pub struct NatsSourceLog {
    jetstream: Arc<Context>,
    config: NatsStreamConfig,
    consumer: Consumer<PullConfig>,
    /// The message currently awaiting ack on this worker. A worker
    /// processes one record to completion before fetching the next, so at
    /// most one entry is ever held: retry attempts for one record are never
    /// interleaved with processing of a different record.
    pending: Mutex<Option<(u64, Message)>>,
}

impl NatsSourceLog {
    /// Connect, ensuring the source stream and durable consumer exist.
    pub async fn connect(jetstream: Context, config: NatsStreamConfig) -> Result<Self, NatsError> {
        let jetstream = Arc::new(jetstream);
        ensure_stream(&jetstream, &config).await?;
        let consumer = ensure_consumer(&jetstream, &config).await?;

        Ok(Self {
            jetstream,
            config,
            consumer,
            pending: Mutex::new(None),
        })
    }

    /// Build another worker's view onto the same durable consumer, so
    /// JetStream fans deliveries out across independently-polling workers.
    pub fn clone_for_worker(&self) -> Self {
        Self {
            jetstream: self.jetstream.clone(),
            config: self.config.clone(),
            consumer: self.consumer.clone(),
            pending: Mutex::new(None),
        }
    }

    async fn fetch_one(&self) -> Result<Option<LogRecord>, NatsError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(self.config.fetch_timeout)
            .messages()
            .await
            .map_err(NatsError::from_jetstream_error)?;

        match messages.next().await {
            Some(Ok(message)) => {
                let info = message
                    .info()
                    .map_err(|e| NatsError::consumer_error(e.to_string()))?;
                let sequence = info.stream_sequence;
                let delivery_count = info.delivered as u32;

                if delivery_count > 1 {
                    debug!(sequence, delivery_count, "processing redelivered message");
                }
                warn_on_high_redelivery(delivery_count, self.config.max_deliver);

                let headers = message
                    .headers
                    .as_ref()
                    .map(|h| {
                        h.iter()
                            .flat_map(|(name, values)| {
                                values
                                    .iter()
                                    .map(move |v| (name.to_string(), v.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let record = LogRecord {
                    topic: self.config.source_subject.clone(),
                    partition: 0,
                    offset: sequence,
                    key: None,
                    value: message.payload.to_vec(),
                    headers,
                };

                *self.pending.lock().await = Some((sequence, message));
                Ok(Some(record))
            }
            Some(Err(e)) => Err(NatsError::consumer_error(e.to_string())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DurableLog for NatsSourceLog {
    async fn fetch_message(&self, cancel: &mut CancelSignal) -> Result<LogRecord, LogError> {
        loop {
            if *cancel.borrow() {
                return Err(LogError::Cancelled);
            }
            tokio::select! {
                biased;
                _ = cancel.changed() => return Err(LogError::Cancelled),
                fetched = self.fetch_one() => {
                    match fetched.map_err(LogError::from)? {
                        Some(record) => return Ok(record),
                        None => continue,
                    }
                }
            }
        }
    }

    async fn commit_message(
        &self,
        record: &LogRecord,
        _cancel: &mut CancelSignal,
    ) -> Result<(), LogError> {
        let mut slot = self.pending.lock().await;
        match slot.take() {
            Some((sequence, message)) if sequence == record.offset => {
                message
                    .ack()
                    .await
                    .map_err(|e| NatsError::consumer_error(e.to_string()))?;
                Ok(())
            }
            Some(other) => {
                *slot = Some(other);
                Err(LogError::Unavailable(
                    "commit called for a record other than the one pending ack".to_string(),
                ))
            }
            None => Err(LogError::Unavailable(
                "no pending message to commit".to_string(),
            )),
        }
    }
}

async fn ensure_stream(jetstream: &Context, config: &NatsStreamConfig) -> Result<(), NatsError> {
    match jetstream.get_stream(&config.source_stream).await {
        Ok(_) => {
            debug!(stream = %config.source_stream, "source stream already exists");
            Ok(())
        }
        Err(_) => {
            info!(stream = %config.source_stream, subject = %config.source_subject, "creating source stream");
            jetstream
                .create_stream(StreamConfig {
                    name: config.source_stream.clone(),
                    subjects: vec![config.source_subject.clone()],
                    max_messages: 1_000_000,
                    max_age: Duration::from_secs(7 * 24 * 60 * 60),
                    ..Default::default()
                })
                .await
                .map_err(NatsError::from_jetstream_error)?;
            Ok(())
        }
    }
}

async fn ensure_consumer(
    jetstream: &Context,
    config: &NatsStreamConfig,
) -> Result<Consumer<PullConfig>, NatsError> {
    let stream = jetstream
        .get_stream(&config.source_stream)
        .await
        .map_err(NatsError::from_jetstream_error)?;

    match stream
        .get_consumer::<PullConfig>(&config.consumer_durable_name)
        .await
    {
        Ok(consumer) => {
            debug!(consumer = %config.consumer_durable_name, "durable consumer already exists");
            Ok(consumer)
        }
        Err(_) => {
            info!(consumer = %config.consumer_durable_name, "creating durable consumer");
            stream
                .create_consumer(PullConfig {
                    durable_name: Some(config.consumer_durable_name.clone()),
                    name: Some(config.consumer_durable_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: config.ack_wait,
                    max_deliver: config.max_deliver,
                    filter_subject: config.source_subject.clone(),
                    ..Default::default()
                })
                .await
                .map_err(NatsError::from_jetstream_error)
        }
    }
}

/// Resync helper for the case where `max_deliver` redeliveries are
/// exhausted on JetStream's own side (the process crashed mid-retry more
/// than `max_deliver` times). JetStream then stops redelivering; operators
/// can raise `max_deliver` or purge the consumer. The core's own retry
/// budget is independent and typically exhausts long before this.
pub fn warn_on_high_redelivery(delivery_count: u32, max_deliver: i64) {
    if max_deliver > 0 && delivery_count as i64 >= max_deliver {
        warn!(
            delivery_count,
            max_deliver, "message nearing JetStream's own max_deliver ceiling"
        );
    }
}
