//! Exponential backoff with a cap and uniform jitter. Attempt `n`'s delay is
//! `min(base * 2^(n-1), max) * (1 + jitter_ratio * U)`, `U` uniform in
//! `[0, 1)`.

use anyhow::Error;
use rand::Rng;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
        let capped = backoff_secs.min(self.max_delay.as_secs_f64());
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(capped * (1.0 + self.jitter_ratio * jitter))
    }
}

#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: Error,
}

impl fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation failed after {} attempts: {}", self.attempts, self.last_error)
    }
}

impl std::error::Error for RetryExhausted {}

/// Runs `operation` up to `policy.max_attempts` times, sleeping
/// `policy.delay_for_attempt(n)` between attempts, stopping early when
/// `should_retry` returns false for the latest error.
pub async fn run_with_retry<T, Op, Fut, ShouldRetry>(
    policy: RetryPolicy,
    mut operation: Op,
    should_retry: ShouldRetry,
) -> Result<T, RetryExhausted>
where
    Op: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
    ShouldRetry: Fn(&Error) -> bool,
{
    let mut last_error: Option<Error> = None;
    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let retry = attempt < policy.max_attempts && should_retry(&e);
                last_error = Some(e);
                if !retry {
                    break;
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
    }
    Err(RetryExhausted {
        attempts: policy.max_attempts,
        last_error: last_error.expect("loop runs at least once"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_respects_the_cap() {
        let policy = RetryPolicy { jitter_ratio: 0.0, ..RetryPolicy::default() };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(10), policy.max_delay);
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_works() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { base_delay: Duration::from_millis(1), ..RetryPolicy::default() };
        let result = run_with_retry(
            policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(42) }
            },
            |_| true,
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_ratio: 0.0,
        };
        let err = run_with_retry(
            policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>(anyhow!("transient")) }
            },
            |_| true,
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn stops_early_when_should_retry_says_no() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { base_delay: Duration::from_millis(1), ..RetryPolicy::default() };
        let _ = run_with_retry(
            policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>(anyhow!("permanent")) }
            },
            |_| false,
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
