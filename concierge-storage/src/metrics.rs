//! Prometheus metrics for the data-access layer
//!
//! This module defines metrics for:
//! - Circuit breaker state and transitions
//! - Retry attempts
//! - Connection pool occupancy and failures
//! - Query latency and slow queries
//! - Monitor alerts

use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    GaugeVec, HistogramVec, IntCounterVec, IntGauge,
};

lazy_static! {
    /// Circuit breaker state gauge
    ///
    /// Values:
    /// - 0 = closed (normal operation)
    /// - 1 = open (fail-fast mode)
    /// - 2 = half-open (trial call in flight)
    ///
    /// Labels:
    /// - key: Breaker key (operation name, e.g. "guests.find_many")
    pub static ref CIRCUIT_BREAKER_STATE: GaugeVec = register_gauge_vec!(
        "concierge_db_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=open, 2=half_open)",
        &["key"]
    )
    .expect("Failed to register circuit_breaker_state metric");

    /// Incremented each time a breaker transitions to open
    pub static ref CIRCUIT_BREAKER_OPENS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "concierge_db_circuit_breaker_opens_total",
        "Total number of circuit breaker open events",
        &["key"]
    )
    .expect("Failed to register circuit_breaker_opens_total metric");

    /// Half-open trial calls and their outcomes
    ///
    /// Labels:
    /// - key: Breaker key
    /// - result: "success", "failure" or "abandoned"
    pub static ref CIRCUIT_BREAKER_HALF_OPEN_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "concierge_db_circuit_breaker_half_open_attempts_total",
        "Total number of half-open trial calls",
        &["key", "result"]
    )
    .expect("Failed to register circuit_breaker_half_open_attempts_total metric");

    /// Retries scheduled by the error handler
    ///
    /// Labels:
    /// - key: Breaker key
    /// - kind: Error kind that triggered the retry
    pub static ref RETRY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "concierge_db_retry_attempts_total",
        "Total number of retried datastore operations",
        &["key", "kind"]
    )
    .expect("Failed to register retry_attempts_total metric");

    pub static ref POOL_IDLE_CONNECTIONS: IntGauge = register_int_gauge!(
        "concierge_db_pool_idle_connections",
        "Idle connections held by the pool"
    )
    .expect("Failed to register pool_idle_connections metric");

    pub static ref POOL_ACTIVE_CONNECTIONS: IntGauge = register_int_gauge!(
        "concierge_db_pool_active_connections",
        "Connections currently checked out of the pool"
    )
    .expect("Failed to register pool_active_connections metric");

    pub static ref POOL_WAITING_ACQUIRERS: IntGauge = register_int_gauge!(
        "concierge_db_pool_waiting_acquirers",
        "Callers queued for a pooled connection"
    )
    .expect("Failed to register pool_waiting_acquirers metric");

    /// Acquire timeouts and connection-level failures
    ///
    /// Labels:
    /// - reason: "acquire_timeout", "connect", "health_check" or "invalidated"
    pub static ref POOL_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "concierge_db_pool_errors_total",
        "Total number of connection pool errors",
        &["reason"]
    )
    .expect("Failed to register pool_errors_total metric");

    /// Query execution latency
    ///
    /// Labels:
    /// - operation: Operation name (e.g. "service_requests.count")
    /// - status: "success" or "error"
    pub static ref QUERY_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "concierge_db_query_duration_seconds",
        "Datastore query latency in seconds",
        &["operation", "status"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register query_duration_seconds metric");

    pub static ref SLOW_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "concierge_db_slow_queries_total",
        "Total number of queries slower than the slow-query threshold",
        &["operation"]
    )
    .expect("Failed to register slow_queries_total metric");

    /// Labels:
    /// - rule: Alert rule id
    /// - severity: "info", "warning" or "critical"
    pub static ref ALERTS_RAISED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "concierge_db_alerts_raised_total",
        "Total number of monitor alerts raised",
        &["rule", "severity"]
    )
    .expect("Failed to register alerts_raised_total metric");
}
