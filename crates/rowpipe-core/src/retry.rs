//! Exponential-backoff retry for the writer boundary.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Retry parameters for `write_batch`. Attempt *k* (1-based) waits
/// `initial_delay * 2^(k-1)` before re-running.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    /// Delay inserted before retry attempt `attempt` (1-based count of
    /// failures so far).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `op` until it succeeds, exhausts the attempt budget, or fails
    /// with an error the policy must not retry (cancellation and
    /// configuration errors propagate immediately).
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && err.is_retryable() => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{what} failed, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipeError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn two_transient_failures_then_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let out = policy
            .run("write", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PipeError::Transient("flaky".into()))
                    } else {
                        Ok(99u64)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 10ms after the first failure + 20ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn cancellation_propagates_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let calls = AtomicU32::new(0);
        let err = policy
            .run::<u64, _, _>("write", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipeError::Cancelled) }
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn config_errors_do_not_retry() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let err = policy
            .run::<u64, _, _>("write", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipeError::InvalidConfiguration("bad".into())) }
            })
            .await
            .unwrap_err();
        assert!(err.is_config());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_surfaces_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let err = policy
            .run::<u64, _, _>("write", || async {
                Err(PipeError::Transient("still down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipeError::Transient(_)));
    }
}
