//! Error type for the NATS JetStream adapters.

use ingest_core::LogError;
use thiserror::Error;

/// Error that can occur in a NATS JetStream adapter operation.
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(#[from] async_nats::ConnectError),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stream not found: {0}")]
    StreamNotFound(String),
}

impl NatsError {
    pub fn from_jetstream_error(error: impl std::fmt::Display) -> Self {
        Self::JetStream(error.to_string())
    }

    pub fn publish_error(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    pub fn consumer_error(msg: impl Into<String>) -> Self {
        Self::Consumer(msg.into())
    }
}

/// Every adapter failure surfaces to the processing loop as
/// [`LogError::Unavailable`] — cancellation has its own, earlier-checked
/// path and never reaches this conversion.
impl From<NatsError> for LogError {
    fn from(err: NatsError) -> Self {
        LogError::Unavailable(err.to_string())
    }
}
