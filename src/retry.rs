//! Bounded retry with fixed or exponential delay.
//!
//! External calls never loop-and-sleep inline; they take a [`RetryPolicy`]
//! so the retry contract is visible at the call site and testable on its
//! own. Only transient failures are retried — a malformed request or a
//! declared outage returns immediately.

use std::future::Future;
use std::time::Duration;

use crate::errors::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first (0 = no retries).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay before retry number `attempt` (1-based). Exponential doubles
    /// per attempt, capped at 2^5 × base.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => self.base_delay * (1u32 << (attempt - 1).min(5)),
        }
    }

    /// Run `f` until it succeeds, fails non-transiently, or the attempt
    /// budget is exhausted. The closure receives the 0-based attempt index.
    pub async fn run<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err: Option<PipelineError> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.delay_for(attempt)).await;
            }
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| PipelineError::Transform("retries exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_retries, Duration::ZERO)
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential(8, Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        // Capped.
        assert_eq!(policy.delay_for(7), Duration::from_secs(32));
        assert_eq!(policy.delay_for(8), Duration::from_secs(32));
    }

    #[test]
    fn test_fixed_delays() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = instant_policy(3)
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PipelineError::Transform("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = instant_policy(2)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::Transform("always".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = instant_policy(5)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::Unavailable("down".into())) }
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
