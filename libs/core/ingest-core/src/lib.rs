//! Domain core of the event ingestion consumer: decoding, error
//! classification, retry policy, the dead-letter envelope, and the
//! processing loop that ties them together.
//!
//! Free of any NATS or Postgres vocabulary — the [`DurableLog`],
//! [`DeadLetterLog`] and [`Store`] traits are the only seam, so
//! [`ProcessingLoop`] can be driven against in-memory fakes in tests and
//! against real adapters in production.

pub mod dlq;
pub mod error;
pub mod event;
pub mod processing;
pub mod retry;
pub mod traits;

pub use dlq::{DlqEnvelope, HEADER_DLQ_REASON, HEADER_ORIGINAL_TOPIC};
pub use error::{classify, ErrorKind, ProcessingError};
pub use event::{decode_event, DecodeError, Event, LogRecord};
pub use processing::{Outcome, ProcessingLoop, PER_ATTEMPT_DEADLINE};
pub use retry::{Cancelled, RetryPolicy};
pub use traits::{
    CancelSignal, DeadLetterLog, DurableLog, LogError, LoopMetrics, NoopMetrics, Store, StoreError,
};
