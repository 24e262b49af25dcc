//! Activity retry policy.
//!
//! Exponential backoff with an interval cap, a per-activity timeout, and a
//! terminal list: errors whose kind is non-retryable fail immediately, and
//! some kinds cap their own attempt count below the policy maximum.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::activities::ActivityError;

/// Retry parameters applied to every activity in a workflow.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub maximum_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// Ceiling on one attempt of one activity.
    pub activity_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(30),
            activity_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_interval.mul_f64(factor.max(1.0));
        delay.min(self.maximum_interval)
    }

    /// Run an activity under this policy.
    ///
    /// Retries only retryable kinds, honors per-kind attempt caps, and
    /// aborts the backoff sleep promptly on cancellation.
    pub async fn run<T, F, Fut>(
        &self,
        activity: &str,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<T, ActivityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(ActivityError::Cancelled);
            }

            let result = match tokio::time::timeout(self.activity_timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(ActivityError::UpstreamUnavailable(format!(
                    "activity {activity} timed out after {:?}",
                    self.activity_timeout
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let allowed = error
                        .attempt_cap()
                        .map(|cap| cap.min(self.maximum_attempts))
                        .unwrap_or(self.maximum_attempts);
                    if !error.is_retryable() || attempt >= allowed {
                        return Err(error);
                    }

                    let delay = self.delay_after_attempt(attempt);
                    warn!(
                        activity,
                        attempt,
                        "retrying after {:?}: {}",
                        delay,
                        error
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ActivityError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            maximum_attempts: 3,
            initial_interval: Duration::from_millis(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_millis(8),
            activity_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(4));
        // Capped at the maximum interval.
        assert_eq!(policy.delay_after_attempt(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_transient_errors_retried_to_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = attempts.clone();

        let result = fast_policy()
            .run("test", &cancel, move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ActivityError::UpstreamUnavailable("503".into()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = attempts.clone();

        let result: Result<(), _> = fast_policy()
            .run("test", &cancel, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ActivityError::ExtractionPermanent("no text".into()))
                }
            })
            .await;

        assert!(matches!(
            result.unwrap_err(),
            ActivityError::ExtractionPermanent(_)
        ));
        // Exactly one attempt, no retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = attempts.clone();

        let result: Result<(), _> = fast_policy()
            .run("test", &cancel, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ActivityError::UpstreamUnavailable("always down".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_storage_exhausted_capped_at_two() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = attempts.clone();

        let result: Result<(), _> = fast_policy()
            .run("test", &cancel, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ActivityError::StorageExhausted("all dead".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(3600),
            ..fast_policy()
        };

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });

        let result: Result<(), _> = policy
            .run("test", &cancel, || async {
                Err(ActivityError::UpstreamUnavailable("down".into()))
            })
            .await;

        assert!(matches!(result.unwrap_err(), ActivityError::Cancelled));
    }
}
