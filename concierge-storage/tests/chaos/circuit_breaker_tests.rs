//! Circuit Breaker Chaos Tests
//!
//! These tests validate the breaker behind `ErrorHandler` under various
//! failure scenarios including:
//! - Threshold-based opening
//! - Half-open trial admission
//! - Concurrent callers during the trial
//! - Recovery through the full executor pipeline

use crate::support::ChaosBackend;
use concierge_storage::circuit_breaker::CircuitState;
use concierge_storage::executor::QueryExecutor;
use concierge_storage::optimizer::{OptimizerConfig, QueryOptimizer};
use concierge_storage::{
    CircuitBreakerConfig, ConnectionPool, Error, ErrorHandler, OperationContext, PoolConfig,
    RetryPolicy, Statement,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Handler with a single attempt per call so every call counts once
fn test_handler(failure_threshold: u32, reset_timeout_ms: u64) -> ErrorHandler {
    ErrorHandler::new(
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        },
        CircuitBreakerConfig {
            failure_threshold,
            reset_timeout: Duration::from_millis(reset_timeout_ms),
        },
    )
}

fn ctx(key: &str) -> OperationContext {
    OperationContext::new(key).with_tenant("hotel-a")
}

fn unique_key() -> String {
    format!("guests.find_many.{}", uuid::Uuid::new_v4())
}

async fn fail_once(handler: &ErrorHandler, key: &str) {
    let _ = handler
        .execute_with_retry(
            || async { Err::<(), _>(Error::ConnectionFailed("refused".into())) },
            &ctx(key),
            key,
        )
        .await;
}

#[tokio::test]
async fn circuit_opens_after_exact_failure_threshold() {
    let handler = test_handler(3, 1000);
    let key = unique_key();

    for i in 0..2 {
        fail_once(&handler, &key).await;
        assert_eq!(
            handler.circuit_breaker_state(&key).unwrap().state,
            CircuitState::Closed,
            "Circuit should NOT be open after {} failures",
            i + 1
        );
    }

    fail_once(&handler, &key).await;
    let state = handler.circuit_breaker_state(&key).unwrap();
    assert_eq!(state.state, CircuitState::Open);
    assert_eq!(state.failure_count, 3);
}

#[tokio::test]
async fn circuit_rejects_without_running_operation_when_open() {
    let handler = test_handler(2, 10_000);
    let key = unique_key();
    for _ in 0..2 {
        fail_once(&handler, &key).await;
    }

    let calls = AtomicU32::new(0);
    let start = std::time::Instant::now();
    let result = handler
        .execute_with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("should not execute")
            },
            &ctx(&key),
            &key,
        )
        .await;

    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    match result {
        Err(Error::CircuitOpen { key: open_key, .. }) => assert_eq!(open_key, key),
        other => panic!("expected CircuitOpen, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn circuit_closes_on_successful_trial() {
    let handler = test_handler(5, 30_000);
    let key = unique_key();
    for _ in 0..5 {
        fail_once(&handler, &key).await;
    }
    assert_eq!(
        handler.circuit_breaker_state(&key).unwrap().state,
        CircuitState::Open
    );

    tokio::time::advance(Duration::from_millis(30_000)).await;

    let result = handler
        .execute_with_retry(|| async { Ok("recovered") }, &ctx(&key), &key)
        .await;
    assert_eq!(result.unwrap(), "recovered");

    let state = handler.circuit_breaker_state(&key).unwrap();
    assert_eq!(state.state, CircuitState::Closed);
    assert_eq!(state.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn circuit_reopens_on_failed_trial() {
    let handler = test_handler(2, 50);
    let key = unique_key();
    for _ in 0..2 {
        fail_once(&handler, &key).await;
    }

    tokio::time::advance(Duration::from_millis(75)).await;
    fail_once(&handler, &key).await;

    assert_eq!(
        handler.circuit_breaker_state(&key).unwrap().state,
        CircuitState::Open
    );
    let result = handler
        .execute_with_retry(|| async { Ok(()) }, &ctx(&key), &key)
        .await;
    assert!(result.unwrap_err().is_circuit_open());
}

#[tokio::test(start_paused = true)]
async fn circuit_admits_one_trial_among_concurrent_callers() {
    let handler = Arc::new(test_handler(2, 100));
    let key = unique_key();
    for _ in 0..2 {
        fail_once(&handler, &key).await;
    }
    tokio::time::advance(Duration::from_millis(150)).await;

    let executions = Arc::new(AtomicU32::new(0));
    let mut handles = vec![];
    for _ in 0..5 {
        let handler = handler.clone();
        let executions = executions.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            handler
                .execute_with_retry(
                    || {
                        let executions = executions.clone();
                        async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, Error>("trial")
                        }
                    },
                    &ctx(&key),
                    &key,
                )
                .await
                .is_ok()
        }));
    }

    let results: Vec<bool> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(
        handler.circuit_breaker_state(&key).unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn success_resets_failure_counter() {
    let handler = test_handler(3, 1000);
    let key = unique_key();

    for _ in 0..2 {
        fail_once(&handler, &key).await;
    }
    handler
        .execute_with_retry(|| async { Ok(()) }, &ctx(&key), &key)
        .await
        .unwrap();

    for _ in 0..2 {
        fail_once(&handler, &key).await;
    }
    assert_eq!(
        handler.circuit_breaker_state(&key).unwrap().state,
        CircuitState::Closed,
        "Counter should have been reset"
    );

    fail_once(&handler, &key).await;
    assert_eq!(
        handler.circuit_breaker_state(&key).unwrap().state,
        CircuitState::Open
    );
}

#[tokio::test]
async fn breaker_keys_are_independent() {
    let handler = test_handler(1, 60_000);
    fail_once(&handler, "guests.count").await;

    assert!(handler
        .execute_with_retry(|| async { Ok(()) }, &ctx("guests.count"), "guests.count")
        .await
        .unwrap_err()
        .is_circuit_open());
    handler
        .execute_with_retry(
            || async { Ok(()) },
            &ctx("service_requests.count"),
            "service_requests.count",
        )
        .await
        .unwrap();
    assert_eq!(
        handler.breakers().open_circuits(),
        vec!["guests.count".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn executor_retries_through_connection_resets() {
    let backend = ChaosBackend::new();
    let pool = ConnectionPool::connect(
        backend.factory(),
        PoolConfig {
            max_connections: 2,
            min_connections: 1,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let handler = Arc::new(ErrorHandler::new(
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            ..Default::default()
        },
        CircuitBreakerConfig::default(),
    ));
    let optimizer = Arc::new(QueryOptimizer::new(OptimizerConfig::default()));
    let executor = QueryExecutor::new(
        pool.clone(),
        handler.clone(),
        optimizer.clone(),
        Duration::from_secs(5),
    );

    backend.fail_next(2);
    let ctx = ctx("guests.find_many");
    let rows = executor
        .fetch(&ctx, &Statement::raw("SELECT 1", Vec::new()))
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(backend.statements(), 3);
    // Both reset connections were discarded rather than returned to idle
    assert_eq!(pool.status().total_destroyed, 2);
    let state = handler.circuit_breaker_state("guests.find_many").unwrap();
    assert_eq!(state.state, CircuitState::Closed);
    assert_eq!(state.failure_count, 0);

    let stats = optimizer.window_stats(Duration::from_secs(60));
    assert_eq!(stats.total_queries, 1);
    assert_eq!(stats.errors, 2);
}
