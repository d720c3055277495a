//! Bounded exponential back-off with jitter, and the cancellable sleep that
//! is the core's primary suspension point.

use std::time::Duration;
use tokio::sync::watch;

use crate::error::ErrorKind;

/// Immutable retry configuration.
///
/// `attempt` throughout this module is the 0-indexed count of failed
/// attempts already made.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    /// `max_retries` defaults to 5; the remaining fields take the same
    /// defaults as the database layer's own retry policy.
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_ratio: 0.5,
        }
    }
}

/// Cancellation observed while sleeping between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sleep cancelled by shutdown signal")]
pub struct Cancelled;

impl RetryPolicy {
    /// `true` iff `kind == Transient` and the attempt budget is not yet
    /// exhausted. A policy with `max_retries = 0` permits exactly one
    /// attempt.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        kind == ErrorKind::Transient && attempt < self.max_retries
    }

    /// `clamp(base_delay * multiplier^attempt, _, max_delay)`, widened with
    /// uniform jitter of `± jitter_ratio * delay` and floored at
    /// `base_delay`.
    ///
    /// All arithmetic is done in floating point so that exponential growth
    /// cannot overflow an integer type before the clamp is applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;

        let grown = base_ms * self.multiplier.powi(attempt as i32);
        let clamped = grown.min(max_ms).max(base_ms.min(max_ms));

        let jitter_span = clamped * self.jitter_ratio;
        let jitter = uniform_jitter(attempt, jitter_span);
        let jittered = clamped + jitter;

        let floored = jittered.max(base_ms);
        Duration::from_secs_f64(floored / 1000.0)
    }

    /// Sleep for `delay(attempt)`, returning early with [`Cancelled`] if
    /// `cancel` fires first. This is the primary suspension point of the
    /// core and must never block a clean shutdown.
    pub async fn sleep(
        &self,
        attempt: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Cancelled> {
        if *cancel.borrow() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(self.delay(attempt)) => Ok(()),
            _ = cancel.changed() => Err(Cancelled),
        }
    }
}

/// A uniform pseudo-random value in `[-span, span]`.
///
/// Hash-based rather than a dedicated RNG crate: jitter has no need for a
/// cryptographic randomness source.
fn uniform_jitter(seed: u32, span: f64) -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    if span <= 0.0 {
        return 0.0;
    }
    let sample = (RandomState::new().hash_one((seed, std::time::SystemTime::now())) % 2001) as f64
        / 1000.0
        - 1.0; // uniform in [-1.0, 1.0]
    sample * span
}
