//! Stream/consumer naming and timing for the NATS JetStream adapters.
//!
//! This is a plain configuration value, not a `core_config::FromEnv` — the
//! app crate aggregates the ingest-wide environment surface (including
//! these fields) into one `IngestConfig` and builds a `NatsStreamConfig`
//! from it, matching how `WorkerConfig` used to be handed a `StreamConfig`.

use std::time::Duration;

/// Naming and timing for the source stream/consumer and the DLQ stream.
#[derive(Debug, Clone)]
pub struct NatsStreamConfig {
    /// JetStream stream backing the source log.
    pub source_stream: String,

    /// Subject the source stream captures (and the consumer filters on).
    pub source_subject: String,

    /// Durable consumer name; shared across worker processes in the same
    /// consumer group so JetStream fans messages out across them.
    pub consumer_durable_name: String,

    /// JetStream stream backing the dead-letter log.
    pub dlq_stream: String,

    /// Subject dead-lettered envelopes are published to.
    pub dlq_subject: String,

    /// Safety-net redelivery cap independent of the core's own retry
    /// budget: the core retries in-process before ack/nak; this bounds
    /// retries across process crashes.
    pub max_deliver: i64,

    /// How long JetStream waits for an ack before redelivering.
    pub ack_wait: Duration,

    /// How long a single `fetch` call blocks waiting for a message.
    pub fetch_timeout: Duration,

    /// Port the health/metrics HTTP server binds.
    pub health_port: u16,
}

impl Default for NatsStreamConfig {
    fn default() -> Self {
        Self {
            source_stream: "EVENTS".to_string(),
            source_subject: "events.ingest".to_string(),
            consumer_durable_name: "ingest-worker".to_string(),
            dlq_stream: "EVENTS_DLQ".to_string(),
            dlq_subject: "events.ingest.dlq".to_string(),
            max_deliver: 3,
            ack_wait: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
            health_port: 8081,
        }
    }
}

impl NatsStreamConfig {
    pub fn with_source_stream(mut self, name: impl Into<String>) -> Self {
        self.source_stream = name.into();
        self
    }

    pub fn with_source_subject(mut self, subject: impl Into<String>) -> Self {
        self.source_subject = subject.into();
        self
    }

    pub fn with_consumer_durable_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_durable_name = name.into();
        self
    }

    pub fn with_dlq_stream(mut self, name: impl Into<String>) -> Self {
        self.dlq_stream = name.into();
        self
    }

    pub fn with_dlq_subject(mut self, subject: impl Into<String>) -> Self {
        self.dlq_subject = subject.into();
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_health_port(mut self, port: u16) -> Self {
        self.health_port = port;
        self
    }
}
