//! # Concierge Storage
//!
//! Resilient, tenant-scoped data access for the Concierge guest-service
//! backend. Every statement issued against PostgreSQL flows through the same
//! pipeline:
//!
//! 1. [`repository::Repository`] builds a parameterized statement with a forced
//!    projection and a mandatory tenant predicate ([`query`]).
//! 2. [`handler::ErrorHandler`] wraps the call with classification, retry and a
//!    per-operation circuit breaker.
//! 3. [`pool::ConnectionPool`] supplies a connection for the attempt.
//! 4. [`optimizer::QueryOptimizer`] records latency and row counts, and
//!    [`monitor::DatabaseMonitor`] folds them into rolling health snapshots and
//!    alerts.
//!
//! [`layer::DataLayer`] wires the pieces together and owns their lifecycle.

pub mod backend;
pub mod circuit_breaker;
pub mod classify;
pub mod config;
pub mod entity;
pub mod executor;
pub mod handler;
pub mod layer;
pub mod metrics;
pub mod migrations;
pub mod models;
pub mod monitor;
pub mod optimizer;
pub mod pool;
pub mod postgres;
pub mod query;
pub mod repository;
pub mod retry;
pub mod telemetry;
pub mod tenant;

use std::time::Duration;

// Re-export commonly used types
pub use backend::{Connection, ConnectionFactory, Record};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use classify::{ClassifiedError, ErrorKind, Severity};
pub use config::DataLayerConfig;
pub use entity::{Column, Entity};
pub use handler::ErrorHandler;
pub use layer::DataLayer;
pub use models::{Guest, ServiceRequest, StaffMember};
pub use monitor::DatabaseMonitor;
pub use optimizer::QueryOptimizer;
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use postgres::PostgresConnectionFactory;
pub use query::{Filter, SortOrder, Statement};
pub use repository::{Page, PageRequest, Pagination, Repository};
pub use retry::RetryPolicy;
pub use tenant::{Elevated, OperationContext, TenantId, TenantScope};

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Tenant isolation violation: {0}")]
    TenantViolation(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by datastore (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("Connection pool is shut down")]
    PoolClosed,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to open a new connection: {0}")]
    FailedConnection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Circuit breaker '{key}' is open, rejecting operation (retry in {retry_after:?})")]
    CircuitOpen { key: String, retry_after: Duration },

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Classified(Box<ClassifiedError>),
}

impl Error {
    /// Error category as seen by the retry/circuit-breaker machinery
    pub fn kind(&self) -> ErrorKind {
        classify::classify(self).kind
    }

    /// True when the operation was rejected by an open circuit breaker
    /// without being attempted.
    pub fn is_circuit_open(&self) -> bool {
        match self {
            Error::CircuitOpen { .. } => true,
            Error::Classified(inner) => inner.source.is_circuit_open(),
            _ => false,
        }
    }

    /// The innermost error, unwrapping classification metadata
    pub fn root(&self) -> &Error {
        match self {
            Error::Classified(inner) => inner.source.root(),
            other => other,
        }
    }
}

impl From<ClassifiedError> for Error {
    fn from(err: ClassifiedError) -> Self {
        Error::Classified(Box::new(err))
    }
}
