//! Retry policy shared by the catalog walker and the fetch scheduler.
//!
//! The walker retries a whole page request in place; the scheduler instead
//! persists a per-entry attempt counter and re-enqueues the item after the
//! delay computed here, so cancellation can interrupt between attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// What the error classifier tells the retry loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Exponential backoff with jitter so concurrent workers hitting the same
/// rate limit don't stampede the remote in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_secs: 5,
            max_delay_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` failures so far
    /// (0-indexed): `min(base * 2^attempt, max) + jitter(0..base)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay_secs
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped = doubled.min(self.max_delay_secs);
        let jitter = if self.base_delay_secs > 0 {
            rand::thread_rng().gen_range(0..self.base_delay_secs)
        } else {
            0
        };
        Duration::from_secs(capped + jitter)
    }
}

/// Retry an async operation in place with exponential backoff.
///
/// `classifier` decides per error whether another attempt is worthwhile.
/// Returns the first `Ok`, or the last error once attempts are exhausted or
/// the classifier aborts.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    policy: &RetryPolicy,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let attempts = policy.max_retries + 1;
    let mut last = None;

    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if classifier(&e) == RetryAction::Abort {
                    return Err(e);
                }
                if attempt + 1 >= attempts {
                    last = Some(e);
                    break;
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    "transient error (attempt {}/{}), retrying in {}s: {}",
                    attempt + 1,
                    attempts,
                    delay.as_secs(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last.expect("at least one attempt was made"))
}
