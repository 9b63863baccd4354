//! Bounded retry with capped exponential backoff.
//!
//! Wraps an operation in up to `max_retries` re-attempts. Backoff doubles per
//! attempt up to a cap, with a small random jitter so concurrent persisters
//! do not retry in lockstep. Exhausting the budget surfaces the final error
//! to the caller.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
    backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            backoff_cap,
        }
    }

    /// Total attempts made in the worst case: 1 + max_retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries => {
                    let delay = self.backoff_for(attempt);
                    attempt += 1;
                    log::warn!(
                        "attempt {}/{} failed, retrying in {:?}: {}",
                        attempt,
                        self.max_attempts(),
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.backoff_cap);
        let jitter_span = (exp.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_span);
        exp + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(4),
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = policy(3)
            .run(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_final_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), String> = policy(2)
            .run(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("failure {}", n)) }
            })
            .await;
        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = policy(0)
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("nope") }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
