//! NATS JetStream adapters implementing `ingest_core`'s `DurableLog` and
//! `DeadLetterLog` traits, plus the health/metrics server the worker binary
//! exposes alongside the processing loop.
//!
//! [`NatsSourceLog`] pulls from the source stream with an explicit-ack
//! durable consumer; [`NatsDeadLetterLog`] publishes [`ingest_core::DlqEnvelope`]s
//! to a separate DLQ stream. Neither crate module knows about event decoding
//! or retry policy — those stay in `ingest-core`, driving these adapters
//! through its trait objects.

mod config;
mod dlq;
mod error;
mod health;
pub mod metrics;
mod source;

pub use config::NatsStreamConfig;
pub use dlq::NatsDeadLetterLog;
pub use error::NatsError;
pub use health::{HealthServer, HealthState, HealthStatus};
pub use metrics::{init_metrics, IngestMetrics};
pub use source::NatsSourceLog;
