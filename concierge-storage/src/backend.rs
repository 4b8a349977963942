//! Datastore connection abstraction
//!
//! The pool manages boxed [`Connection`]s produced by a [`ConnectionFactory`].
//! The PostgreSQL implementation lives in [`crate::postgres`]; tests plug in
//! an in-memory datastore through the same traits.

use crate::query::Statement;
use crate::Result;
use async_trait::async_trait;

/// A single result row, keyed by column name
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A live connection to the datastore
#[async_trait]
pub trait Connection: Send {
    /// Run a statement that returns rows
    async fn fetch(&mut self, statement: &Statement) -> Result<Vec<Record>>;

    /// Run a statement that modifies rows, returning the affected row count
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    /// Lightweight round-trip used by health checks
    async fn ping(&mut self) -> Result<()>;

    /// Disconnect. The connection must not be used afterwards.
    async fn close(&mut self) -> Result<()>;

    async fn begin(&mut self) -> Result<()> {
        self.execute(&Statement::raw("BEGIN", Vec::new())).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute(&Statement::raw("COMMIT", Vec::new())).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute(&Statement::raw("ROLLBACK", Vec::new())).await.map(|_| ())
    }
}

/// Opens new connections for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Name used in logs and metrics (e.g. "postgresql")
    fn backend_name(&self) -> &'static str {
        "datastore"
    }
}
