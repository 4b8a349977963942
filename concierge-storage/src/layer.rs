//! Composition root for the data-access layer

use crate::backend::{Connection, ConnectionFactory};
use crate::classify::{classify, ErrorKind};
use crate::config::DataLayerConfig;
use crate::entity::Entity;
use crate::executor::QueryExecutor;
use crate::handler::ErrorHandler;
use crate::monitor::{DatabaseMonitor, MonitorSnapshot};
use crate::optimizer::QueryOptimizer;
use crate::pool::{ConnectionPool, HealthReport};
use crate::postgres::{log_server_version, set_tenant_statement, PostgresConnectionFactory};
use crate::repository::Repository;
use crate::tenant::TenantId;
use crate::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

/// Owns the pool, error handler, optimizer and monitor, and hands out
/// repositories that share them
pub struct DataLayer {
    config: DataLayerConfig,
    pool: ConnectionPool,
    handler: Arc<ErrorHandler>,
    optimizer: Arc<QueryOptimizer>,
    monitor: Arc<DatabaseMonitor>,
    executor: QueryExecutor,
}

impl DataLayer {
    /// Connect to PostgreSQL at `config.database_url`
    pub async fn connect(config: DataLayerConfig) -> Result<Self> {
        let factory = PostgresConnectionFactory::new(&config.database_url)?;
        if config.run_migrations {
            factory.migrate().await?;
        }
        let layer = Self::with_factory(Arc::new(factory), config).await?;
        if let Ok(mut conn) = layer.pool.acquire().await {
            log_server_version(&mut *conn).await;
        }
        Ok(layer)
    }

    /// Build the layer over any backend. Opens `min_connections` eagerly
    /// and fails if the backend is unreachable.
    pub async fn with_factory(
        factory: Arc<dyn ConnectionFactory>,
        config: DataLayerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let backend = factory.backend_name();

        let pool = ConnectionPool::connect(factory, config.pool.clone()).await?;
        let optimizer = Arc::new(QueryOptimizer::new(config.optimizer.clone()));
        pool.add_listener(optimizer.clone());
        let handler = Arc::new(ErrorHandler::new(
            config.retry.clone(),
            config.circuit_breaker.clone(),
        ));
        let monitor = Arc::new(DatabaseMonitor::new(
            pool.clone(),
            optimizer.clone(),
            handler.clone(),
            config.monitor.clone(),
        ));
        let executor = QueryExecutor::new(
            pool.clone(),
            handler.clone(),
            optimizer.clone(),
            config.query_timeout,
        );

        pool.start_maintenance();
        if config.enable_monitor {
            monitor.start();
        }

        info!(
            backend,
            max_connections = config.pool.max_connections,
            min_connections = config.pool.min_connections,
            monitor = config.enable_monitor,
            "Data layer initialized"
        );

        Ok(Self {
            config,
            pool,
            handler,
            optimizer,
            monitor,
            executor,
        })
    }

    pub fn repository<E: Entity>(&self) -> Repository<E> {
        Repository::new(self.executor.clone())
    }

    pub fn config(&self) -> &DataLayerConfig {
        &self.config
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

    pub fn monitor(&self) -> &Arc<DatabaseMonitor> {
        &self.monitor
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Probe idle connections, then take a fresh monitor snapshot
    pub async fn health_check(&self) -> (HealthReport, MonitorSnapshot) {
        let report = self.pool.health_check().await;
        let snapshot = self.monitor.tick().await;
        (report, snapshot)
    }

    /// Run `f` inside a transaction with `app.current_tenant` set for
    /// row-level security. Commits on `Ok`, rolls back on `Err`.
    ///
    /// The closure is not retried.
    #[instrument(skip(self, f), fields(db.system = "postgresql", tenant_id = %tenant))]
    pub async fn with_tenant_transaction<F, T>(&self, tenant: &TenantId, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let start = Instant::now();
        let mut conn = self.pool.acquire().await?;

        if let Err(e) = conn.begin().await {
            if classify(&e).kind == ErrorKind::Connection {
                conn.invalidate();
            }
            return Err(e);
        }

        let result = match conn.execute(&set_tenant_statement(tenant.as_str())).await {
            Ok(_) => f(&mut *conn).await,
            Err(e) => Err(e),
        };

        let result = match result {
            Ok(value) => match conn.commit().await {
                Ok(()) => Ok(value),
                Err(e) => Err(e),
            },
            Err(e) => {
                if let Err(rollback) = conn.rollback().await {
                    warn!(error = %rollback, "Rollback failed, discarding connection");
                    conn.invalidate();
                    return Err(e);
                }
                Err(e)
            }
        };

        let elapsed = start.elapsed();
        if elapsed > self.optimizer.config().slow_query_threshold {
            warn!(
                tenant_id = %tenant,
                duration_ms = elapsed.as_millis() as u64,
                "Slow tenant transaction"
            );
        }
        result
    }

    /// Stop the monitor, then drain and close the pool
    pub async fn shutdown(&self) {
        self.monitor.stop();
        self.pool.shutdown().await;
        info!("Data layer shut down");
    }
}
