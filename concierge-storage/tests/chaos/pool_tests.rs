//! Connection Pool Chaos Tests
//!
//! Capacity limits, waiter hand-off, shutdown and connection churn under
//! an unreliable backend.

use crate::support::ChaosBackend;
use concierge_storage::{ConnectionPool, Error, PoolConfig};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn config(max: u32, min: u32) -> PoolConfig {
    PoolConfig {
        max_connections: max,
        min_connections: min,
        acquire_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Let spawned pool tasks (closes, replenishment) run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn acquire_blocks_at_capacity_until_release() {
    let backend = ChaosBackend::new();
    let pool = ConnectionPool::connect(backend.factory(), config(3, 1))
        .await
        .unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(pool.status().active, 3);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
    };
    settle().await;
    assert!(!waiter.is_finished());
    assert_eq!(pool.status().waiting, 1);

    let released_id = held[0].id();
    held.remove(0).release();

    // The waiter is handed the released connection, no new one is opened
    assert_eq!(waiter.await.unwrap().unwrap(), released_id);
    assert_eq!(pool.status().total_created, 3);
    assert_eq!(backend.state.opened.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_never_exceed_max_connections() {
    let backend = ChaosBackend::new();
    let pool = ConnectionPool::connect(backend.factory(), config(4, 0))
        .await
        .unwrap();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let conn = pool.acquire().await?;
                let active = pool.status().active;
                tokio::time::sleep(Duration::from_millis(10)).await;
                conn.release();
                Ok::<_, Error>(active)
            })
        })
        .collect();

    for handle in futures::future::join_all(handles).await {
        let active = handle.unwrap().unwrap();
        assert!(active <= 4, "observed {} active connections", active);
    }
    assert!(backend.state.opened.load(Ordering::SeqCst) <= 4);
    let status = pool.status();
    assert_eq!(status.active, 0);
    assert_eq!(status.waiting, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_waiters_and_closes_returned_connections() {
    let backend = ChaosBackend::new();
    let pool = ConnectionPool::connect(backend.factory(), config(1, 1))
        .await
        .unwrap();

    let held = pool.acquire().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
    };
    settle().await;
    assert_eq!(pool.status().waiting, 1);

    pool.shutdown().await;
    assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
    assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));

    // Still checked out, so still open
    assert_eq!(backend.state.live(), 1);
    drop(held);
    settle().await;
    assert_eq!(backend.state.live(), 0);
    assert!(pool.status().closed);
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_fails_startup() {
    let backend = ChaosBackend::new();
    backend.refuse_connects(true);

    let err = ConnectionPool::connect(backend.factory(), config(5, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FailedConnection(_)));
}

#[tokio::test(start_paused = true)]
async fn invalidated_connection_is_replaced_up_to_min() {
    let backend = ChaosBackend::new();
    let pool = ConnectionPool::connect(backend.factory(), config(5, 2))
        .await
        .unwrap();
    assert_eq!(backend.state.opened.load(Ordering::SeqCst), 2);

    let conn = pool.acquire().await.unwrap();
    conn.invalidate();
    settle().await;

    let status = pool.status();
    assert_eq!(status.idle, 2);
    assert_eq!(status.total_destroyed, 1);
    assert_eq!(backend.state.opened.load(Ordering::SeqCst), 3);
    assert_eq!(backend.state.live(), 2);
}

#[tokio::test(start_paused = true)]
async fn pool_recovers_after_backend_comes_back() {
    let backend = ChaosBackend::new();
    let pool = ConnectionPool::connect(backend.factory(), config(2, 0))
        .await
        .unwrap();

    backend.refuse_connects(true);
    assert!(pool.acquire().await.is_err());
    assert_eq!(pool.status().failed_connections, 1);

    backend.refuse_connects(false);
    // The next attempt waits out the connect backoff, then succeeds
    let conn = pool.acquire().await.unwrap();
    conn.release();
    assert_eq!(pool.status().idle, 1);
}
