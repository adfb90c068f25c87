use std::future::Future;
use std::time::Duration;

use common_exception::{FilterError, Result};
use tracing::debug;

/// Bounded exponential backoff.
///
/// `max_attempts` counts the first try, so a policy with `max_attempts = 1`
/// never retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy is exhausted. Exhaustion is reported as `TransientLock` carrying the
/// number of attempts made.
pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                debug!(op = label, attempt, ?delay, "transient failure, retrying: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(FilterError::TransientLock { path, .. }) => {
                return Err(FilterError::TransientLock {
                    path,
                    attempts: attempt,
                });
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
        }
    }

    fn locked() -> FilterError {
        FilterError::TransientLock {
            path: "db.sqlite".to_owned(),
            attempts: 1,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(2), Duration::from_millis(100));
        assert_eq!(policy.delay_after(20), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn succeeds_within_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = retry_with_backoff(fast_policy(4), "test", move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { if attempt < 3 { Err(locked()) } else { Ok(attempt) } }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts() {
        let err = retry_with_backoff(fast_policy(3), "test", |_| async { Err::<(), _>(locked()) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FilterError::TransientLock {
                path: "db.sqlite".to_owned(),
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = retry_with_backoff(fast_policy(5), "test", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(FilterError::Internal("boom".to_owned())) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), common_exception::ErrorKind::Internal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
