//! Retry policy for transient failures.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};

/// Fixed-delay retry policy.
///
/// An operation is attempted once plus up to `max_retries` more times while
/// the retry predicate accepts the error. The same policy is used for agent
/// invocations and LLM calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(2_000),
        }
    }
}

/// Successful value plus the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Last error plus the number of attempts consumed.
#[derive(Debug)]
pub struct Exhausted {
    pub error: DomainError,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Execute `operation`, retrying errors for which `DomainError::is_transient`
    /// holds.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<Attempted<T>, Exhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        self.execute_if(operation, DomainError::is_transient).await
    }

    /// Execute `operation` with a custom retryable-error predicate. The
    /// closure receives the 1-based attempt number.
    pub async fn execute_if<F, Fut, T, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<Attempted<T>, Exhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DomainResult<T>>,
        P: Fn(&DomainError) -> bool,
    {
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    if attempt <= self.max_retries && is_retryable(&error) {
                        warn!(
                            attempt,
                            max_attempts = self.max_attempts(),
                            error = %error,
                            delay_ms = self.delay.as_millis() as u64,
                            "transient failure, retrying"
                        );
                        if !self.delay.is_zero() {
                            sleep(self.delay).await;
                        }
                        attempt += 1;
                    } else {
                        return Err(Exhausted {
                            error,
                            attempts: attempt,
                        });
                    }
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

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let result = policy.execute(|_| async { Ok::<_, DomainError>(7) }).await.unwrap();
        assert_eq!(result.value, 7);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = policy
            .execute(move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(DomainError::invocation("connection reset", true))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let err = policy
            .execute(|attempt| async move {
                Err::<(), _>(DomainError::invocation(format!("attempt {attempt}"), true))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.error.to_string(), "Agent invocation failed: attempt 3");
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let err = policy
            .execute(|_| async { Err::<(), _>(DomainError::DimensionNotFound("x".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn test_timeouts_consume_attempts() {
        let policy = RetryPolicy::new(1, Duration::ZERO);
        let err = policy
            .execute(|_| async { Err::<(), _>(DomainError::InvocationTimeout { timeout_ms: 5 }) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(matches!(err.error, DomainError::InvocationTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_fixed_delay_between_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(2_000));
        let start = tokio::time::Instant::now();
        let _ = policy
            .execute(|_| async { Err::<(), _>(DomainError::invocation("down", true)) })
            .await;
        assert_eq!(start.elapsed(), Duration::from_millis(4_000));
    }
}
