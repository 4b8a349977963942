//! Retry and circuit-breaker wrapper for datastore operations

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot};
use crate::classify::{classify, ClassifiedError};
use crate::retry::{should_retry, RetryPolicy};
use crate::tenant::OperationContext;
use crate::Result;
use std::future::Future;
use tracing::{error, info, warn};

/// Runs operations with classification, bounded retry and a circuit breaker
/// per operation key
pub struct ErrorHandler {
    retry: RetryPolicy,
    breakers: CircuitBreakerRegistry,
}

impl ErrorHandler {
    pub fn new(retry: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            retry,
            breakers: CircuitBreakerRegistry::new(breaker),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Snapshot of the breaker for `key`, if it has been used
    pub fn circuit_breaker_state(&self, key: &str) -> Option<CircuitBreakerSnapshot> {
        self.breakers.state(key)
    }

    /// Run `operation` under `key`'s circuit breaker.
    ///
    /// An open circuit fails fast with [`Error::CircuitOpen`](crate::Error::CircuitOpen)
    /// without calling `operation`. Transient failures are retried with
    /// backoff up to the policy's attempt limit; the half-open trial gets a
    /// single attempt. The final failure is counted against the breaker and
    /// returned wrapped in a [`ClassifiedError`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        ctx: &OperationContext,
        key: &str,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.breakers.try_acquire(key)?;
        let max_attempts = if permit.is_trial() {
            1
        } else {
            self.retry.max_attempts.max(1)
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = %ctx.operation,
                            tenant_id = %ctx.tenant_label(),
                            trace_id = %ctx.trace_id,
                            key = %key,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    permit.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    let classification = classify(&err);
                    if attempt < max_attempts && should_retry(&classification, attempt, &self.retry)
                    {
                        let delay = self.retry.next_delay(attempt, &classification);
                        warn!(
                            operation = %ctx.operation,
                            tenant_id = %ctx.tenant_label(),
                            trace_id = %ctx.trace_id,
                            key = %key,
                            attempt,
                            kind = %classification.kind,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retrying failed operation"
                        );
                        crate::metrics::RETRY_ATTEMPTS_TOTAL
                            .with_label_values(&[key, classification.kind.as_str()])
                            .inc();
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    permit.record_failure(&err);
                    let classified = ClassifiedError::new(err, ctx.clone(), attempt);
                    if classified.retryable {
                        error!(
                            operation = %ctx.operation,
                            tenant_id = %ctx.tenant_label(),
                            trace_id = %ctx.trace_id,
                            key = %key,
                            attempts = attempt,
                            kind = %classified.kind,
                            error = %classified.source,
                            "Operation failed, retries exhausted"
                        );
                    } else {
                        warn!(
                            operation = %ctx.operation,
                            tenant_id = %ctx.tenant_label(),
                            trace_id = %ctx.trace_id,
                            key = %key,
                            kind = %classified.kind,
                            error = %classified.source,
                            "Operation failed with non-retryable error"
                        );
                    }
                    return Err(classified.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::classify::ErrorKind;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn handler(max_attempts: u32, threshold: u32) -> ErrorHandler {
        ErrorHandler::new(
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                ..Default::default()
            },
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(1),
            },
        )
    }

    fn ctx() -> OperationContext {
        OperationContext::new("guests.find_many").with_tenant("hotel-a")
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let handler = handler(3, 5);
        let calls = AtomicU32::new(0);

        let result = handler
            .execute_with_retry(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::ConnectionFailed("reset by peer".into()))
                    } else {
                        Ok(42)
                    }
                },
                &ctx(),
                "guests.find_many",
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let state = handler.circuit_breaker_state("guests.find_many").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_classified_error() {
        let handler = handler(3, 5);
        let calls = AtomicU32::new(0);

        let err = handler
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::Timeout("statement timeout".into()))
                },
                &ctx(),
                "guests.find_many",
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::Classified(classified) => {
                assert_eq!(classified.kind, ErrorKind::Timeout);
                assert_eq!(classified.attempts, 3);
                assert!(classified.retryable);
                assert_eq!(classified.context.tenant_label(), "hotel-a");
            }
            other => panic!("expected classified error, got {:?}", other),
        }
        assert_eq!(
            handler.circuit_breaker_state("guests.find_many").unwrap().failure_count,
            1
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let handler = handler(3, 5);
        let calls = AtomicU32::new(0);

        let err = handler
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::AlreadyExists("guest".into()))
                },
                &ctx(),
                "guests.create_many",
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Constraint);
        assert!(matches!(err.root(), Error::AlreadyExists(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_then_trial_closes_it() {
        let handler = handler(1, 5);
        let key = "service_requests.find_many";
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let _ = handler
                .execute_with_retry(
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(Error::ConnectionFailed("refused".into()))
                    },
                    &ctx(),
                    key,
                )
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            handler.circuit_breaker_state(key).unwrap().state,
            CircuitState::Open
        );

        let err = handler
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                &ctx(),
                key,
            )
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::advance(Duration::from_secs(1)).await;

        handler
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                &ctx(),
                key,
            )
            .await
            .unwrap();
        let state = handler.circuit_breaker_state(key).unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_gets_single_attempt() {
        let handler = handler(3, 1);
        let key = "guests.count";
        let calls = AtomicU32::new(0);
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Timeout("slow".into()))
        };

        let _ = handler.execute_with_retry(failing, &ctx(), key).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(2)).await;
        let _ = handler.execute_with_retry(failing, &ctx(), key).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            handler.circuit_breaker_state(key).unwrap().state,
            CircuitState::Open
        );
    }
}
