//! The external collaborators the processing loop is generic over:
//! the durable log (source and dead-letter), the relational store, and the
//! metrics sink.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

use crate::dlq::DlqEnvelope;
use crate::error::ErrorKind;
use crate::event::LogRecord;

/// Cancellation signal shared by every suspension point.
pub type CancelSignal = watch::Receiver<bool>;

/// Error surfaced by the durable log adapter (fetch/commit/produce).
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("cancelled")]
    Cancelled,
    #[error("log unavailable: {0}")]
    Unavailable(String),
}

/// Error surfaced by the store adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Processing(#[from] crate::error::ProcessingError),
}

/// The source (and, symmetrically, dead-letter) durable log.
///
/// Auto-commit MUST be disabled by implementations: `commit_message` is the
/// only way an offset advances.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Yield the next record, or block until one is available or
    /// `cancel` fires.
    async fn fetch_message(&self, cancel: &mut CancelSignal) -> Result<LogRecord, LogError>;

    /// Record `record`'s offset as processed. Never called until the
    /// record's fate (persisted or dead-lettered) is finalized.
    async fn commit_message(
        &self,
        record: &LogRecord,
        cancel: &mut CancelSignal,
    ) -> Result<(), LogError>;
}

/// The dead-letter log producer.
#[async_trait]
pub trait DeadLetterLog: Send + Sync {
    /// Publish `envelope` with all-in-sync-replica acknowledgment, along
    /// with its forensic headers.
    async fn send(
        &self,
        envelope: &DlqEnvelope,
        cancel: &mut CancelSignal,
    ) -> Result<(), LogError>;

    /// Flush any pending writes. Invoked during shutdown.
    async fn close(&self) -> Result<(), LogError>;
}

/// The relational store the core persists events into.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent on `event_id`: a duplicate insert is a silent no-op.
    async fn insert_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &[u8],
    ) -> Result<(), StoreError>;
}

/// Observes the processing loop's state transitions. Every method has a
/// no-op default so adapters only override the counters they care about,
/// and tests can run without a metrics backend at all.
pub trait LoopMetrics: Send + Sync {
    fn record_received(&self) {}
    fn record_persisted(&self) {}
    fn record_dead_lettered(&self, _kind: ErrorKind) {}
    fn record_retried(&self) {}
    fn record_store_duration(&self, _duration: Duration) {}
}

/// The default metrics sink: observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl LoopMetrics for NoopMetrics {}
