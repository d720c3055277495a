//! The orchestrator: drives a single record from fetch to terminal state.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dlq::DlqEnvelope;
use crate::error::{classify, ErrorKind};
use crate::event::{decode_event, DecodeError, LogRecord};
use crate::retry::RetryPolicy;
use crate::traits::{
    CancelSignal, DeadLetterLog, DurableLog, LogError, LoopMetrics, NoopMetrics, Store, StoreError,
};

/// Per-attempt deadline for a single store call, independent of the
/// overall cancellation signal so the worker can still be cancelled
/// mid-attempt.
pub const PER_ATTEMPT_DEADLINE: Duration = Duration::from_secs(5);

/// The terminal state a record ended up in, for tests and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Store acknowledged, offset committed. `attempts` is the number of
    /// store calls made (always 1 unless a prior transient failure was
    /// retried).
    Persisted { attempts: u32 },
    /// Envelope produced to the dead-letter log, offset committed.
    DeadLettered { kind: ErrorKind, retries: u32 },
    /// Cancellation observed during fetch or retry sleep; offset NOT
    /// committed. The record will be redelivered.
    Abandoned,
    /// The dead-letter write itself failed; offset NOT committed. The
    /// record will be redelivered and re-attempted in full.
    StuckOnDlqFailure,
}

/// Drives records from a [`DurableLog`] through a [`Store`], dead-lettering
/// via a [`DeadLetterLog`] on unrecoverable failure.
pub struct ProcessingLoop<L, S, D, M = NoopMetrics> {
    log: L,
    store: S,
    dead_letter: D,
    policy: RetryPolicy,
    metrics: M,
}

impl<L, S, D> ProcessingLoop<L, S, D, NoopMetrics>
where
    L: DurableLog,
    S: Store,
    D: DeadLetterLog,
{
    pub fn new(log: L, store: S, dead_letter: D, policy: RetryPolicy) -> Self {
        Self {
            log,
            store,
            dead_letter,
            policy,
            metrics: NoopMetrics,
        }
    }
}

impl<L, S, D, M> ProcessingLoop<L, S, D, M>
where
    L: DurableLog,
    S: Store,
    D: DeadLetterLog,
    M: LoopMetrics,
{
    /// Swap in a metrics sink, e.g. the adapter crate's Prometheus recorder.
    pub fn with_metrics<M2: LoopMetrics>(self, metrics: M2) -> ProcessingLoop<L, S, D, M2> {
        ProcessingLoop {
            log: self.log,
            store: self.store,
            dead_letter: self.dead_letter,
            policy: self.policy,
            metrics,
        }
    }

    /// Run until `cancel` fires. Each record is processed to completion
    /// before the next is fetched, so offsets commit in monotonically
    /// non-decreasing order within this worker.
    pub async fn run(&self, mut cancel: CancelSignal) {
        loop {
            let record = match self.log.fetch_message(&mut cancel).await {
                Ok(record) => record,
                Err(LogError::Cancelled) => {
                    info!("shutdown signal received during fetch, worker exiting");
                    return;
                }
                Err(LogError::Unavailable(reason)) => {
                    error!(reason, "fetch failed, worker exiting");
                    return;
                }
            };
            self.metrics.record_received();

            let outcome = self.process_one(&record, &mut cancel).await;
            match &outcome {
                Outcome::Abandoned => {
                    info!(
                        offset = record.offset,
                        partition = record.partition,
                        "worker shutting down, record abandoned without commit"
                    );
                    return;
                }
                Outcome::StuckOnDlqFailure => {
                    error!(
                        offset = record.offset,
                        partition = record.partition,
                        "CRITICAL: failed to write to DLQ, record will be redelivered"
                    );
                }
                Outcome::Persisted { attempts } => {
                    self.metrics.record_persisted();
                    info!(
                        offset = record.offset,
                        partition = record.partition,
                        attempts,
                        "event persisted"
                    );
                }
                Outcome::DeadLettered { kind, retries } => {
                    self.metrics.record_dead_lettered(*kind);
                    info!(
                        offset = record.offset,
                        partition = record.partition,
                        error_kind = %kind,
                        retries,
                        "routed to DLQ"
                    );
                }
            }
        }
    }

    /// Drive a single record through the decode/insert/retry/dead-letter
    /// state machine.
    pub async fn process_one(&self, record: &LogRecord, cancel: &mut CancelSignal) -> Outcome {
        let event = match decode_event(&record.value) {
            Ok(event) => event,
            Err(decode_err) => {
                let kind = ErrorKind::Permanent;
                return self
                    .dead_letter_and_commit(record, decode_err.to_string(), kind, 0, cancel)
                    .await;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            let payload = serde_json::to_vec(&event.payload).unwrap_or_default();
            let attempt_result = self.try_insert(&event.event_id, &event.event_type, &payload).await;

            match attempt_result {
                Ok(()) => {
                    return self.commit_and_return(record, Outcome::Persisted { attempts: attempt + 1 }, cancel).await;
                }
                Err((kind, message)) => {
                    if kind == ErrorKind::Permanent {
                        return self
                            .dead_letter_and_commit(record, message, kind, attempt + 1, cancel)
                            .await;
                    }

                    if !self.policy.should_retry(kind, attempt) {
                        return self
                            .dead_letter_and_commit(record, message, kind, attempt + 1, cancel)
                            .await;
                    }

                    warn!(
                        event_id = %event.event_id,
                        attempt,
                        error = %message,
                        "transient store failure, retrying"
                    );

                    match self.policy.sleep(attempt, cancel).await {
                        Ok(()) => {
                            self.metrics.record_retried();
                            attempt += 1;
                            continue;
                        }
                        Err(_cancelled) => return Outcome::Abandoned,
                    }
                }
            }
        }
    }

    /// Attempt a single store insert under the per-attempt deadline.
    /// Deadline expiry is classified `Transient` unless the store raised a
    /// `ProcessingError` with an explicit kind.
    async fn try_insert(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &[u8],
    ) -> Result<(), (ErrorKind, String)> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            PER_ATTEMPT_DEADLINE,
            self.store.insert_event(event_id, event_type, payload),
        )
        .await;
        self.metrics.record_store_duration(started.elapsed());

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(StoreError::Processing(processing_error))) => {
                let kind = classify(&processing_error);
                Err((kind, processing_error.to_string()))
            }
            Err(_elapsed) => Err((ErrorKind::Transient, "store attempt deadline exceeded".to_string())),
        }
    }

    async fn dead_letter_and_commit(
        &self,
        record: &LogRecord,
        error_message: String,
        kind: ErrorKind,
        retries: u32,
        cancel: &mut CancelSignal,
    ) -> Outcome {
        let envelope = DlqEnvelope::new(record, error_message, kind, retries);
        if let Err(e) = self.dead_letter.send(&envelope, cancel).await {
            debug!(error = %e, "dead-letter send failed");
            return Outcome::StuckOnDlqFailure;
        }
        self.commit_and_return(record, Outcome::DeadLettered { kind, retries }, cancel)
            .await
    }

    async fn commit_and_return(&self, record: &LogRecord, outcome: Outcome, cancel: &mut CancelSignal) -> Outcome {
        if let Err(e) = self.log.commit_message(record, cancel).await {
            // A commit failure after a successful terminal decision is
            // logged, never retried. Redelivery is absorbed downstream
            // (store idempotency, DLQ dedup).
            error!(error = %e, offset = record.offset, "offset commit failed after terminal decision");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessingError;
    use crate::traits::CancelSignal;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeLog {
        records: Mutex<Vec<LogRecord>>,
        committed: Mutex<Vec<u64>>,
    }

    impl FakeLog {
        fn new(records: Vec<LogRecord>) -> Self {
            Self {
                records: Mutex::new(records),
                committed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DurableLog for FakeLog {
        async fn fetch_message(&self, _cancel: &mut CancelSignal) -> Result<LogRecord, LogError> {
            self.records
                .lock()
                .unwrap()
                .pop()
                .ok_or(LogError::Unavailable("empty".to_string()))
        }

        async fn commit_message(&self, record: &LogRecord, _cancel: &mut CancelSignal) -> Result<(), LogError> {
            self.committed.lock().unwrap().push(record.offset);
            Ok(())
        }
    }

    struct FakeDlq {
        sent: Mutex<Vec<DlqEnvelope>>,
        fail: bool,
    }

    impl FakeDlq {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()), fail: false }
        }
        fn failing() -> Self {
            Self { sent: Mutex::new(Vec::new()), fail: true }
        }
    }

    #[async_trait]
    impl DeadLetterLog for FakeDlq {
        async fn send(&self, envelope: &DlqEnvelope, _cancel: &mut CancelSignal) -> Result<(), LogError> {
            if self.fail {
                return Err(LogError::Unavailable("dlq down".to_string()));
            }
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
        async fn close(&self) -> Result<(), LogError> {
            Ok(())
        }
    }

    /// A store whose `n`th call (0-indexed) fails with the given error,
    /// succeeding once the script is exhausted.
    struct ScriptedStore {
        script: Vec<ErrorKind>,
        calls: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(script: Vec<ErrorKind>) -> Self {
            Self { script, calls: AtomicUsize::new(0) }
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Store for ScriptedStore {
        async fn insert_event(&self, _event_id: &str, _event_type: &str, _payload: &[u8]) -> Result<(), StoreError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.get(i) {
                None => Ok(()),
                Some(ErrorKind::Transient) => {
                    Err(StoreError::Processing(ProcessingError::transient("connection refused")))
                }
                Some(ErrorKind::Permanent) => {
                    Err(StoreError::Processing(ProcessingError::permanent(
                        "violates check constraint \"events_type_len\"",
                    )))
                }
            }
        }
    }

    fn record(value: &[u8], offset: u64) -> LogRecord {
        LogRecord {
            topic: "events".to_string(),
            partition: 0,
            offset,
            key: None,
            value: value.to_vec(),
            headers: vec![],
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }

    const VALID_EVENT: &[u8] =
        br#"{"event_id":"3f1b6f0a-6e21-4f1e-8a7e-1f9c9a6f0a10","event_type":"purchase","payload":{"amount":99}}"#;

    #[tokio::test]
    async fn s1_happy_path_commits_with_one_attempt() {
        let store = ScriptedStore::new(vec![]);
        let dlq = FakeDlq::new();
        let log = FakeLog::new(vec![]);
        let r = record(VALID_EVENT, 1);
        let (_tx, mut cancel) = watch::channel(false);

        let worker = ProcessingLoop::new(log, store, dlq, fast_policy(5));
        let outcome = worker.process_one(&r, &mut cancel).await;

        assert_eq!(outcome, Outcome::Persisted { attempts: 1 });
        assert_eq!(worker.store.calls(), 1);
        assert!(worker.dead_letter.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn s2_invalid_json_is_dead_lettered_without_store_calls() {
        let store = ScriptedStore::new(vec![]);
        let dlq = FakeDlq::new();
        let log = FakeLog::new(vec![]);
        let r = record(b"{not-valid-json!!!}", 2);
        let (_tx, mut cancel) = watch::channel(false);

        let worker = ProcessingLoop::new(log, store, dlq, fast_policy(5));
        let outcome = worker.process_one(&r, &mut cancel).await;

        assert_eq!(outcome, Outcome::DeadLettered { kind: ErrorKind::Permanent, retries: 0 });
        assert_eq!(worker.store.calls(), 0);
    }

    #[tokio::test]
    async fn s3_missing_fields_is_dead_lettered_without_store_calls() {
        let store = ScriptedStore::new(vec![]);
        let dlq = FakeDlq::new();
        let log = FakeLog::new(vec![]);
        let r = record(br#"{"event_id":"","event_type":"click","payload":{}}"#, 3);
        let (_tx, mut cancel) = watch::channel(false);

        let worker = ProcessingLoop::new(log, store, dlq, fast_policy(5));
        let outcome = worker.process_one(&r, &mut cancel).await;

        assert_eq!(outcome, Outcome::DeadLettered { kind: ErrorKind::Permanent, retries: 0 });
        assert_eq!(worker.store.calls(), 0);
    }

    #[tokio::test]
    async fn s4_transient_recovers_after_two_failures() {
        let store = ScriptedStore::new(vec![ErrorKind::Transient, ErrorKind::Transient]);
        let dlq = FakeDlq::new();
        let log = FakeLog::new(vec![]);
        let r = record(VALID_EVENT, 4);
        let (_tx, mut cancel) = watch::channel(false);

        let worker = ProcessingLoop::new(log, store, dlq, fast_policy(5));
        let outcome = worker.process_one(&r, &mut cancel).await;

        assert_eq!(outcome, Outcome::Persisted { attempts: 3 });
        assert_eq!(worker.store.calls(), 3);
        assert!(worker.dead_letter.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn s5_transient_exhausted_is_dead_lettered_after_budget() {
        let store = ScriptedStore::new(vec![
            ErrorKind::Transient,
            ErrorKind::Transient,
            ErrorKind::Transient,
            ErrorKind::Transient,
        ]);
        let dlq = FakeDlq::new();
        let log = FakeLog::new(vec![]);
        let r = record(VALID_EVENT, 5);
        let (_tx, mut cancel) = watch::channel(false);

        let worker = ProcessingLoop::new(log, store, dlq, fast_policy(3));
        let outcome = worker.process_one(&r, &mut cancel).await;

        assert_eq!(outcome, Outcome::DeadLettered { kind: ErrorKind::Transient, retries: 4 });
        assert_eq!(worker.store.calls(), 4);
    }

    #[tokio::test]
    async fn s6_permanent_store_failure_is_dead_lettered_on_first_attempt() {
        let store = ScriptedStore::new(vec![ErrorKind::Permanent]);
        let dlq = FakeDlq::new();
        let log = FakeLog::new(vec![]);
        let r = record(VALID_EVENT, 6);
        let (_tx, mut cancel) = watch::channel(false);

        let worker = ProcessingLoop::new(log, store, dlq, fast_policy(5));
        let outcome = worker.process_one(&r, &mut cancel).await;

        assert_eq!(outcome, Outcome::DeadLettered { kind: ErrorKind::Permanent, retries: 1 });
        assert_eq!(worker.store.calls(), 1);
    }

    #[tokio::test]
    async fn s7_zero_retry_policy_dead_letters_after_one_attempt() {
        let store = ScriptedStore::new(vec![ErrorKind::Transient]);
        let dlq = FakeDlq::new();
        let log = FakeLog::new(vec![]);
        let r = record(VALID_EVENT, 7);
        let (_tx, mut cancel) = watch::channel(false);

        let worker = ProcessingLoop::new(log, store, dlq, fast_policy(0));
        let outcome = worker.process_one(&r, &mut cancel).await;

        assert_eq!(outcome, Outcome::DeadLettered { kind: ErrorKind::Transient, retries: 1 });
        assert_eq!(worker.store.calls(), 1);
    }

    #[tokio::test]
    async fn dlq_write_failure_leaves_record_uncommitted() {
        let store = ScriptedStore::new(vec![]);
        let dlq = FakeDlq::failing();
        let log = FakeLog::new(vec![]);
        let r = record(b"{not-valid-json!!!}", 8);
        let (_tx, mut cancel) = watch::channel(false);

        let worker = ProcessingLoop::new(log, store, dlq, fast_policy(5));
        let outcome = worker.process_one(&r, &mut cancel).await;

        assert_eq!(outcome, Outcome::StuckOnDlqFailure);
        assert!(worker.log.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_retry_sleep_abandons_without_commit() {
        let mut slow_policy = fast_policy(5);
        slow_policy.base_delay = Duration::from_secs(30);
        slow_policy.max_delay = Duration::from_secs(30);

        let store = ScriptedStore::new(vec![ErrorKind::Transient, ErrorKind::Transient, ErrorKind::Transient]);
        let dlq = FakeDlq::new();
        let log = FakeLog::new(vec![]);
        let r = record(VALID_EVENT, 9);
        let (tx, mut cancel) = watch::channel(false);

        let worker = ProcessingLoop::new(log, store, dlq, slow_policy);

        let handle = tokio::spawn(async move {
            let outcome = worker.process_one(&r, &mut cancel).await;
            (outcome, worker)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let (outcome, worker) = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("worker did not abandon promptly after cancellation")
            .unwrap();

        assert_eq!(outcome, Outcome::Abandoned);
        assert!(worker.log.committed.lock().unwrap().is_empty());
        assert!(worker.dead_letter.sent.lock().unwrap().is_empty());
    }
}
