//! Error classification for retry and circuit-breaker decisions

use crate::tenant::OperationContext;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Error category as seen by the retry/circuit-breaker machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or session failure (transient)
    Connection,
    /// Statement or acquire deadline exceeded (transient)
    Timeout,
    /// Validation, uniqueness, foreign key, not found, tenant violation (permanent)
    Constraint,
    /// Credentials rejected (permanent)
    Auth,
    /// Pool or server capacity exhausted, serialization conflicts (transient)
    ResourceExhausted,
    /// Datastore asked us to back off (transient)
    RateLimit,
    /// Anything unrecognized (permanent)
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Auth => "auth",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Result of classifying an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    /// Minimum wait requested by the datastore, if any
    pub retry_after: Option<Duration>,
}

impl Classification {
    fn new(kind: ErrorKind, severity: Severity, retryable: bool) -> Self {
        Self {
            kind,
            severity,
            retryable,
            retry_after: None,
        }
    }
}

/// Classify an error. Pure; has no side effects.
pub fn classify(error: &Error) -> Classification {
    use ErrorKind::*;
    use Severity::*;

    match error {
        Error::NotFound(_) | Error::AlreadyExists(_) | Error::ValidationError(_) => {
            Classification::new(Constraint, Low, false)
        }
        Error::Constraint(_) => Classification::new(Constraint, Medium, false),
        Error::TenantViolation(_) => Classification::new(Constraint, Critical, false),
        Error::Auth(_) => Classification::new(Auth, High, false),
        Error::RateLimited { retry_after } => Classification {
            retry_after: *retry_after,
            ..Classification::new(RateLimit, Medium, true)
        },
        Error::PoolExhausted(_) | Error::AcquireTimeout(_) => {
            Classification::new(ResourceExhausted, High, true)
        }
        Error::PoolClosed => Classification::new(Connection, High, false),
        Error::ConnectionFailed(_) | Error::FailedConnection(_) => {
            Classification::new(Connection, High, true)
        }
        Error::Timeout(_) => Classification::new(Timeout, Medium, true),
        Error::CircuitOpen { retry_after, .. } => Classification {
            retry_after: Some(*retry_after),
            ..Classification::new(ResourceExhausted, High, false)
        },
        Error::Migration(_) | Error::Internal(_) => Classification::new(Internal, High, false),
        // Already went through the retry loop once
        Error::Classified(inner) => Classification {
            retryable: false,
            ..classify(&inner.source)
        },
        Error::Database(e) => classify_sqlx(e),
    }
}

fn classify_sqlx(error: &sqlx::Error) -> Classification {
    use ErrorKind::*;
    use Severity::*;

    match error {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            Classification::new(Connection, High, true)
        }
        sqlx::Error::PoolTimedOut => Classification::new(ResourceExhausted, High, true),
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            Classification::new(Connection, Critical, false)
        }
        sqlx::Error::RowNotFound => Classification::new(Constraint, Low, false),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => Classification::new(ResourceExhausted, Medium, true),
            Some("57014") => Classification::new(Timeout, Medium, true),
            Some("53300") => Classification::new(ResourceExhausted, High, true),
            Some(code) if code.starts_with("08") => Classification::new(Connection, High, true),
            Some(code) if code.starts_with("28") => Classification::new(Auth, High, false),
            Some(code) if code.starts_with("23") || code.starts_with("22") => {
                Classification::new(Constraint, Medium, false)
            }
            _ => Classification::new(Internal, High, false),
        },
        _ => Classification::new(Internal, High, false),
    }
}

/// Failure that went through [`ErrorHandler`](crate::handler::ErrorHandler)
#[derive(Debug, thiserror::Error)]
#[error("{} failed after {attempts} attempt(s) [{kind}]: {source}", .context.operation)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub attempts: u32,
    pub context: OperationContext,
    #[source]
    pub source: Error,
}

impl ClassifiedError {
    pub fn new(source: Error, context: OperationContext, attempts: u32) -> Self {
        let c = classify(&source);
        Self {
            kind: c.kind,
            severity: c.severity,
            retryable: c.retryable,
            attempts,
            context,
            source,
        }
    }
}
