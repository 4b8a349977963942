//! Statement execution pipeline
//!
//! Every repository call ends here: the error handler supplies retry and the
//! circuit breaker, each attempt checks a connection out of the pool, runs the
//! statement under the query timeout and reports latency and row counts to
//! the optimizer.

use crate::backend::Record;
use crate::classify::{classify, ErrorKind};
use crate::handler::ErrorHandler;
use crate::optimizer::QueryOptimizer;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::query::Statement;
use crate::tenant::OperationContext;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Shared execution pipeline for repositories
#[derive(Clone)]
pub struct QueryExecutor {
    pool: ConnectionPool,
    handler: Arc<ErrorHandler>,
    optimizer: Arc<QueryOptimizer>,
    query_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(
        pool: ConnectionPool,
        handler: Arc<ErrorHandler>,
        optimizer: Arc<QueryOptimizer>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            handler,
            optimizer,
            query_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }

    pub fn optimizer(&self) -> &Arc<QueryOptimizer> {
        &self.optimizer
    }

    /// Run a row-returning statement. The breaker key is the operation name.
    pub async fn fetch(&self, ctx: &OperationContext, statement: &Statement) -> Result<Vec<Record>> {
        let output = self
            .handler
            .execute_with_retry(|| self.attempt(ctx, Work::Fetch(statement)), ctx, &ctx.operation)
            .await?;
        match output {
            Output::Rows(rows) => Ok(rows),
            Output::Affected(_) => Err(Error::Internal("fetch produced no rows".into())),
        }
    }

    /// Run a statement that modifies rows and return the affected count
    pub async fn execute(&self, ctx: &OperationContext, statement: &Statement) -> Result<u64> {
        self.execute_work(ctx, Work::Execute(statement)).await
    }

    /// Run several modifying statements inside one transaction on one
    /// connection, returning the summed affected count
    pub async fn execute_batch(&self, ctx: &OperationContext, statements: &[Statement]) -> Result<u64> {
        match statements {
            [] => Ok(0),
            [single] => self.execute(ctx, single).await,
            many => self.execute_work(ctx, Work::Batch(many)).await,
        }
    }

    async fn execute_work(&self, ctx: &OperationContext, work: Work<'_>) -> Result<u64> {
        let output = self
            .handler
            .execute_with_retry(|| self.attempt(ctx, work), ctx, &ctx.operation)
            .await?;
        match output {
            Output::Affected(n) => Ok(n),
            Output::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    /// One attempt: acquire, run under the timeout, record, release
    async fn attempt(&self, ctx: &OperationContext, work: Work<'_>) -> Result<Output> {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                self.optimizer.record_error(&ctx.operation, classify(&e).kind);
                return Err(e);
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.query_timeout, work.run(&mut conn)).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation = %ctx.operation,
                    tenant_id = %ctx.tenant_label(),
                    timeout_ms = self.query_timeout.as_millis() as u64,
                    "Query timed out"
                );
                // The statement may still be running server-side
                conn.invalidate();
                self.record_failure(ctx, elapsed, ErrorKind::Timeout);
                return Err(Error::Timeout(format!(
                    "{} exceeded {}ms",
                    ctx.operation,
                    self.query_timeout.as_millis()
                )));
            }
        };

        match result {
            Ok(output) => {
                conn.release();
                let count = output.row_count();
                self.optimizer
                    .track_query(&ctx.operation, work.sql(), elapsed, count);
                crate::metrics::QUERY_DURATION_SECONDS
                    .with_label_values(&[ctx.operation.as_str(), "success"])
                    .observe(elapsed.as_secs_f64());
                debug!(
                    operation = %ctx.operation,
                    tenant_id = %ctx.tenant_label(),
                    duration_ms = elapsed.as_millis() as u64,
                    rows = count,
                    "Query completed"
                );
                Ok(output)
            }
            Err(e) => {
                let kind = classify(&e).kind;
                if kind == ErrorKind::Connection {
                    conn.invalidate();
                } else {
                    conn.release();
                }
                self.record_failure(ctx, elapsed, kind);
                Err(e)
            }
        }
    }

    fn record_failure(&self, ctx: &OperationContext, elapsed: Duration, kind: ErrorKind) {
        self.optimizer.record_error(&ctx.operation, kind);
        crate::metrics::QUERY_DURATION_SECONDS
            .with_label_values(&[ctx.operation.as_str(), "error"])
            .observe(elapsed.as_secs_f64());
    }
}

#[derive(Clone, Copy)]
enum Work<'a> {
    Fetch(&'a Statement),
    Execute(&'a Statement),
    Batch(&'a [Statement]),
}

enum Output {
    Rows(Vec<Record>),
    Affected(u64),
}

impl Output {
    fn row_count(&self) -> u64 {
        match self {
            Output::Rows(rows) => rows.len() as u64,
            Output::Affected(n) => *n,
        }
    }
}

impl Work<'_> {
    fn sql(&self) -> &str {
        match self {
            Work::Fetch(statement) | Work::Execute(statement) => statement.sql(),
            Work::Batch(statements) => statements.first().map(|s| s.sql()).unwrap_or_default(),
        }
    }

    async fn run(self, conn: &mut PooledConnection) -> Result<Output> {
        match self {
            Work::Fetch(statement) => conn.fetch(statement).await.map(Output::Rows),
            Work::Execute(statement) => conn.execute(statement).await.map(Output::Affected),
            Work::Batch(statements) => {
                conn.begin().await?;
                let mut total = 0;
                for statement in statements {
                    match conn.execute(statement).await {
                        Ok(n) => total += n,
                        Err(e) => {
                            if let Err(rollback) = conn.rollback().await {
                                warn!(error = %rollback, "Rollback failed");
                            }
                            return Err(e);
                        }
                    }
                }
                conn.commit().await?;
                Ok(Output::Affected(total))
            }
        }
    }
}
