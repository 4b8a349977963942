//! Timeout Chaos Tests
//!
//! These tests validate that slow statements and a saturated pool surface
//! as timeouts instead of hanging callers.

use crate::support::ChaosBackend;
use concierge_storage::executor::QueryExecutor;
use concierge_storage::optimizer::{OptimizerConfig, QueryOptimizer};
use concierge_storage::{
    CircuitBreakerConfig, ConnectionPool, Error, ErrorHandler, ErrorKind, OperationContext,
    PoolConfig, RetryPolicy, Statement,
};
use std::sync::Arc;
use std::time::Duration;

async fn executor(
    backend: &ChaosBackend,
    pool: PoolConfig,
    query_timeout: Duration,
) -> (QueryExecutor, Arc<QueryOptimizer>) {
    let pool = ConnectionPool::connect(backend.factory(), pool).await.unwrap();
    let handler = Arc::new(ErrorHandler::new(
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        },
        CircuitBreakerConfig::default(),
    ));
    let optimizer = Arc::new(QueryOptimizer::new(OptimizerConfig::default()));
    (
        QueryExecutor::new(pool, handler, optimizer.clone(), query_timeout),
        optimizer,
    )
}

fn ctx() -> OperationContext {
    OperationContext::new("service_requests.find_many").with_tenant("hotel-a")
}

#[tokio::test(start_paused = true)]
async fn slow_statement_times_out_and_discards_connection() {
    let backend = ChaosBackend::new();
    let (executor, optimizer) = executor(
        &backend,
        PoolConfig {
            max_connections: 2,
            min_connections: 1,
            ..Default::default()
        },
        Duration::from_millis(100),
    )
    .await;
    backend.set_latency(Duration::from_secs(10));

    let start = tokio::time::Instant::now();
    let err = executor
        .fetch(&ctx(), &Statement::raw("SELECT pg_sleep(10)", Vec::new()))
        .await
        .unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    match err.root() {
        Error::Timeout(msg) => assert!(msg.contains("service_requests.find_many")),
        other => panic!("expected Timeout, got {:?}", other),
    }

    // A connection that may still be running the statement is not reused
    assert_eq!(executor.pool().status().total_destroyed, 1);
    assert_eq!(optimizer.window_stats(Duration::from_secs(60)).errors, 1);
}

#[tokio::test(start_paused = true)]
async fn fast_statement_completes_within_timeout() {
    let backend = ChaosBackend::new();
    let (executor, optimizer) = executor(
        &backend,
        PoolConfig::default(),
        Duration::from_secs(1),
    )
    .await;
    backend.set_latency(Duration::from_millis(20));

    let affected = executor
        .execute(
            &ctx(),
            &Statement::raw("UPDATE service_requests SET status = $1", vec!["open".into()]),
        )
        .await
        .unwrap();

    assert_eq!(affected, 1);
    let stats = optimizer.window_stats(Duration::from_secs(60));
    assert_eq!(stats.total_queries, 1);
    assert_eq!(stats.errors, 0);
}

#[tokio::test(start_paused = true)]
async fn saturated_pool_times_out_acquire() {
    let backend = ChaosBackend::new();
    let (executor, _) = executor(
        &backend,
        PoolConfig {
            max_connections: 1,
            min_connections: 1,
            acquire_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        Duration::from_secs(5),
    )
    .await;

    let held = executor.pool().acquire().await.unwrap();
    let start = tokio::time::Instant::now();
    let err = executor
        .fetch(&ctx(), &Statement::raw("SELECT 1", Vec::new()))
        .await
        .unwrap_err();

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(matches!(err.root(), Error::AcquireTimeout(_)));
    assert_eq!(executor.pool().status().acquire_timeouts, 1);
    assert_eq!(backend.statements(), 0);

    drop(held);
    executor
        .fetch(&ctx(), &Statement::raw("SELECT 1", Vec::new()))
        .await
        .unwrap();
}
