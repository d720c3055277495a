//! Prometheus metrics for the ingestion worker.

use ingest_core::{ErrorKind, LoopMetrics};
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Counters and gauges for one consumer's worth of processing.
#[derive(Clone)]
pub struct IngestMetrics {
    stream_name: String,
    consumer_name: String,
}

impl IngestMetrics {
    pub fn new(stream_name: &str, consumer_name: &str) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            consumer_name: consumer_name.to_string(),
        }
    }

    /// A record was fetched off the durable log.
    pub fn events_received(&self) {
        counter!(
            "events_received_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .increment(1);
    }

    /// A record was durably persisted into the store.
    pub fn events_persisted(&self) {
        counter!(
            "events_persisted_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .increment(1);
    }

    /// A record was written to the dead-letter log, with the classified
    /// reason it could not be processed.
    pub fn events_dead_lettered(&self, error_kind: &str) {
        counter!(
            "events_dead_lettered_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone(),
            "error_kind" => error_kind.to_string()
        )
        .increment(1);
    }

    /// A transient store failure triggered a retry attempt.
    pub fn events_retried(&self) {
        counter!(
            "events_retried_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .increment(1);
    }

    /// Wall-clock time spent in a single store insert attempt.
    pub fn store_insert_duration(&self, duration: Duration) {
        histogram!(
            "store_insert_duration_seconds",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Current unconsumed message count on the source stream.
    pub fn stream_depth(&self, depth: u64) {
        gauge!(
            "ingest_stream_depth",
            "stream" => self.stream_name.clone()
        )
        .set(depth as f64);
    }

    /// Current message count on the dead-letter stream.
    pub fn dlq_depth(&self, depth: u64) {
        gauge!(
            "ingest_dlq_depth",
            "stream" => self.stream_name.clone()
        )
        .set(depth as f64);
    }
}

/// Wires the processing loop's state transitions into the counters above.
impl LoopMetrics for IngestMetrics {
    fn record_received(&self) {
        self.events_received();
    }

    fn record_persisted(&self) {
        self.events_persisted();
    }

    fn record_dead_lettered(&self, kind: ErrorKind) {
        self.events_dead_lettered(&kind.to_string());
    }

    fn record_retried(&self) {
        self.events_retried();
    }

    fn record_store_duration(&self, duration: Duration) {
        self.store_insert_duration(duration);
    }
}

/// Install the process-global Prometheus recorder and return a handle the
/// health server renders on `/metrics`.
pub fn init_metrics() -> metrics_exporter_prometheus::PrometheusHandle {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    builder
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_do_not_panic_without_a_recorder_installed() {
        let metrics = IngestMetrics::new("EVENTS", "ingest-worker");
        metrics.events_received();
        metrics.events_persisted();
        metrics.events_dead_lettered("transient");
        metrics.events_retried();
        metrics.store_insert_duration(Duration::from_millis(12));
        metrics.stream_depth(3);
        metrics.dlq_depth(0);
    }
}
