//! Reconnect backoff and timeout utilities.
//!
//! The supervisor consults a [`RetryPolicy`] between sessions instead of
//! reconnecting in a tight loop. Delays grow exponentially up to a cap and
//! carry lightweight jitter.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling reconnect attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of consecutive failed attempts before giving up.
    ///
    /// `None` retries forever.
    pub max_attempts: Option<usize>,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Reconnects immediately, forever.
    pub fn immediate() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Waits the same `delay` before every reconnect, forever.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_backoff: delay,
            max_backoff: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Exponential backoff from `initial` doubling up to `max`, forever.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_backoff: initial,
            max_backoff: max.max(initial),
            jitter: Duration::ZERO,
        }
    }

    /// Limits the number of consecutive failed attempts.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Adds up to `jitter` of random delay to each retry.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns whether another attempt is allowed after `failures`
    /// consecutive failures.
    pub fn allows_retry(&self, failures: usize) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the number of
    /// consecutive failures so far.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
            if delay >= self.max_backoff {
                break;
            }
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), Duration::from_secs(5))
            .with_jitter(Duration::from_millis(50))
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
