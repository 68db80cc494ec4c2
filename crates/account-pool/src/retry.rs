//! Bounded retry for transient store errors
//!
//! Store round trips on the outcome path are retried a fixed number of times
//! with exponential backoff and uniform jitter. After the attempts are spent
//! the caller degrades (logs and moves on) instead of failing the request —
//! the request it was bookkeeping for has already completed.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::debug;

/// Attempt count and backoff base for [`with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the second attempt; doubles each retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(25),
        }
    }
}

/// Run `f` until it succeeds or the policy's attempts are spent.
///
/// Each retry sleeps `base_delay * 2^n` plus a uniform jitter of up to the
/// same amount, so concurrent retriers don't stampede the store in lockstep.
/// Returns the final error once attempts are exhausted.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.attempts => {
                let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64);
                debug!(
                    operation,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64 + jitter_ms,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn first_success_needs_no_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            with_retry(&RetryPolicy::default(), "noop", || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(7)
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, String> =
            with_retry(&RetryPolicy::default(), "flaky", || async {
                if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err("store down".to_string())
                } else {
                    Ok("ok")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(10),
        };
        let result: Result<(), String> = with_retry(&policy, "down", || async {
            calls.fetch_add(1, Ordering::Relaxed);
            Err("still down".to_string())
        })
        .await;

        assert_eq!(result.unwrap_err(), "still down");
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }
}
