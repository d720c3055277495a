//! Environment-derived configuration for the ingestion worker.

use core_config::{env_or_default, env_required, ConfigError, FromEnv};
use ingest_core::RetryPolicy;
use nats_log::NatsStreamConfig;
use std::time::Duration;

/// The worker's full environment surface.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub nats_url: String,
    pub database_url: String,
    pub stream: NatsStreamConfig,
    pub retry: RetryPolicy,
    /// Number of concurrent `ProcessingLoop` workers sharing the durable
    /// consumer.
    pub worker_count: usize,
}

impl FromEnv for IngestConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let nats_url = env_required("NATS_URL")?;
        let database_url = env_required("DATABASE_URL")?;

        let max_retries = parse_or_default("MAX_RETRIES", 5)?;
        let base_delay_ms = parse_or_default("RETRY_BASE_DELAY_MS", 100)?;
        let max_delay_ms = parse_or_default("RETRY_MAX_DELAY_MS", 5_000)?;
        let multiplier = parse_or_default("RETRY_MULTIPLIER", 2.0)?;
        let jitter_ratio = parse_or_default("RETRY_JITTER_RATIO", 0.5)?;

        let retry = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            multiplier,
            jitter_ratio,
        };

        let stream = NatsStreamConfig::default()
            .with_source_stream(env_or_default("SOURCE_STREAM", "EVENTS"))
            .with_source_subject(env_or_default("SOURCE_SUBJECT", "events.ingest"))
            .with_consumer_durable_name(env_or_default(
                "CONSUMER_DURABLE_NAME",
                "ingest-worker",
            ))
            .with_dlq_stream(env_or_default("DLQ_STREAM", "EVENTS_DLQ"))
            .with_health_port(parse_or_default("HEALTH_PORT", 8081u16)?);

        let worker_count = parse_or_default("WORKER_COUNT", 1)?;

        Ok(Self {
            nats_url,
            database_url,
            stream,
            retry,
            worker_count,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + ToString,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
