//! Bounded exponential-backoff retry.
//!
//! Wraps a unit of work (one HTTP attempt) and re-invokes it while the
//! failure is classified as transient by the policy. Permanent kinds
//! (authentication, authorization, validation, not-found, client) surface
//! immediately on first occurrence - no retry budget is wasted on errors
//! that cannot self-resolve.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ErrorKind, SnowError};

/// Maximum relative jitter applied to a backoff delay.
const JITTER_FRACTION: f64 = 0.25;

/// Controls how failed attempts are retried.
///
/// Immutable per call; selected at client construction and overridable by
/// the caller per request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Exponential growth factor between attempts.
    pub multiplier: f64,
    /// Whether to perturb each delay by up to ±25%.
    pub jitter: bool,
    /// Error kinds eligible for retry.
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            retryable_kinds: vec![ErrorKind::RateLimit, ErrorKind::Timeout, ErrorKind::Server],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether the policy retries errors of this kind.
    pub fn retries(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    /// Delay before the retry following attempt number `attempt` (0-based).
    ///
    /// Exponential in the attempt number, capped at `max_delay`. Jitter is
    /// multiplicative (a factor in `[0.75, 1.25]`), so the result can never
    /// go negative and needs no fallback clamping.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            capped * (1.0 + rand::rng().random_range(-JITTER_FRACTION..=JITTER_FRACTION))
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

/// Runs `op` under the policy until it succeeds, fails permanently, is
/// cancelled, or the attempt budget is exhausted.
///
/// The inter-attempt sleep races against `cancel`; cancellation aborts
/// immediately with a [`SnowError::Cancelled`], not the attempt's error.
/// On exhaustion the last underlying error is wrapped in
/// [`SnowError::RetriesExhausted`], preserving its kind and status.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, SnowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SnowError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !policy.retries(e.kind()) || !e.is_retryable() {
                    return Err(e);
                }

                attempt += 1;
                if attempt >= max_attempts {
                    return Err(SnowError::RetriesExhausted {
                        attempts: max_attempts,
                        source: Box::new(e),
                    });
                }

                let delay = policy.delay_for(attempt - 1);
                debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SnowError::cancelled("retry backoff"));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
