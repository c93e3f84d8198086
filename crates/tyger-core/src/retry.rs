//! Jittered exponential backoff for transient failures.
//!
//! Per spec.md §4.A, every Repository operation except
//! `create_run_with_idempotency` is wrapped in this retry; per §4.D the
//! engine's resource-creation and observation steps use the same helper with
//! a capped backoff. Grounded on the retry shape of `OutboxDispatcher`'s
//! fail-count handling in `sem_os_server::dispatcher`, generalized into a
//! reusable combinator.

use std::time::Duration;

use rand::Rng;

use crate::error::TygerError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Default policy for Repository operations: generous but bounded.
    pub const fn database() -> Self {
        Self {
            max_attempts: 8,
            base: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Policy for object-storage operations per spec.md §8: up to 50
    /// attempts for `ServerBusy`-style transient responses.
    pub const fn object_storage() -> Self {
        Self {
            max_attempts: 50,
            base: Duration::from_millis(20),
            max_delay: Duration::from_secs(10),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << attempt.min(20));
        let capped = exp.min(self.max_delay.as_millis());
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered as u64)
    }
}

/// Only `TygerError::Transient` is retried; every other variant propagates
/// immediately on the first attempt.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, TygerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TygerError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(TygerError::Transient(msg)) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(TygerError::Transient(format!(
                        "{msg} (exhausted {} retries)",
                        policy.max_attempts
                    )));
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_ok() {
        let calls = AtomicU32::new(0);
        let result = with_retry(RetryPolicy::database(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TygerError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let result = with_retry(policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TygerError::Transient("db blip".into()))
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
    async fn non_transient_errors_never_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TygerError> = with_retry(RetryPolicy::database(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TygerError::NotFound("x".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), TygerError> = with_retry(policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TygerError::Transient("still down".into())) }
        })
        .await;
        assert!(matches!(result, Err(TygerError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
