//! Tenant-scoped repository
//!
//! [`Repository`] is the only read/write surface the application uses. Every
//! call takes an explicit [`TenantScope`], builds its statement through
//! [`crate::query`] (which injects the tenant predicate) and runs it through
//! the [`QueryExecutor`] pipeline. Rows coming back are checked against the
//! scope before they reach the caller.

use crate::backend::Record;
use crate::entity::{Column, Entity, Relation, RelationKind};
use crate::executor::QueryExecutor;
use crate::query::{
    select_related, to_value, AggregateQuery, DeleteQuery, Filter, InsertQuery, SelectQuery,
    SortOrder, UpdateQuery,
};
use crate::tenant::{OperationContext, TenantScope};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use tracing::{error, instrument};

/// Largest page size accepted by [`Repository::find_many_paginated`]
pub const MAX_PAGE_SIZE: u64 = 100;

/// Requested page (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u64,
    pub limit: u64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

impl PageRequest {
    pub fn new(page: u64, limit: u64) -> Self {
        Self { page, limit }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page < 1 {
            return Err(Error::ValidationError("page must be at least 1".to_string()));
        }
        if self.limit < 1 || self.limit > MAX_PAGE_SIZE {
            return Err(Error::ValidationError(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1) * self.limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
    pub total: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn new(request: PageRequest, total: u64) -> Self {
        let total_pages = total.div_ceil(request.limit.max(1));
        Self {
            page: request.page,
            limit: request.limit,
            total,
            total_pages,
            has_next: request.page < total_pages,
            has_prev: request.page > 1,
        }
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

impl Page<Record> {
    /// Decode the rows into `T`
    pub fn decode<T: DeserializeOwned>(self) -> Result<Page<T>> {
        Ok(Page {
            data: decode(self.data)?,
            pagination: self.pagination,
        })
    }
}

/// Deserialize fetched rows. The projection must cover every non-optional
/// field of `T`.
pub fn decode<T: DeserializeOwned>(records: Vec<Record>) -> Result<Vec<T>> {
    records
        .into_iter()
        .map(|record| {
            serde_json::from_value(Value::Object(record))
                .map_err(|e| Error::Internal(format!("failed to decode row: {}", e)))
        })
        .collect()
}

/// CRUD, pagination and aggregates over one entity
pub struct Repository<E: Entity> {
    executor: QueryExecutor,
    caller: Option<OperationContext>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            caller: self.caller.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(executor: QueryExecutor) -> Self {
        Self {
            executor,
            caller: None,
            _entity: PhantomData,
        }
    }

    /// Run operations on behalf of `caller`. Its user id and trace id are
    /// carried into logs and classified errors; operation name and tenant
    /// are still taken from each call.
    pub fn with_context(mut self, caller: OperationContext) -> Self {
        self.caller = Some(caller);
        self
    }

    fn context(&self, operation: &str, scope: &TenantScope) -> OperationContext {
        let operation = format!("{}.{}", E::TABLE, operation);
        match &self.caller {
            Some(caller) => OperationContext {
                operation,
                tenant_id: scope.tenant_id().cloned(),
                user_id: caller.user_id.clone(),
                trace_id: caller.trace_id.clone(),
            },
            None => OperationContext::for_scope(operation, scope),
        }
    }

    /// Start a fluent query; a tenant scope must be set before it runs
    pub fn query(&self) -> QueryBuilder<E> {
        QueryBuilder {
            repository: self.clone(),
            query: SelectQuery::new(),
            scope: None,
        }
    }

    #[instrument(
        skip(self, scope, query),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = E::TABLE,
            tenant_id = %scope
        )
    )]
    pub async fn find_many(&self, scope: &TenantScope, query: SelectQuery<E>) -> Result<Vec<Record>> {
        let statement = query.build(scope)?;
        let ctx = self.context("find_many", scope);
        let rows = self.executor.fetch(&ctx, &statement).await?;
        verify_tenant(scope, E::TENANT_COLUMN.name(), E::TABLE, &rows)?;
        self.resolve_includes(scope, &query, rows).await
    }

    /// Fetch one page and the total match count concurrently
    #[instrument(
        skip(self, scope, query),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = E::TABLE,
            tenant_id = %scope,
            page = request.page,
            limit = request.limit
        )
    )]
    pub async fn find_many_paginated(
        &self,
        scope: &TenantScope,
        query: SelectQuery<E>,
        request: PageRequest,
    ) -> Result<Page<Record>> {
        request.validate()?;
        let filter = query.filter_ref().clone();
        let page_query = query.limit(request.limit).offset(request.offset());

        let (data, total) = tokio::try_join!(
            self.find_many(scope, page_query),
            self.count(scope, filter)
        )?;

        Ok(Page {
            data,
            pagination: Pagination::new(request, total),
        })
    }

    /// Look up one row by primary key
    #[instrument(
        skip(self, scope, key),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = E::TABLE,
            tenant_id = %scope
        )
    )]
    pub async fn find_unique<K: Serialize>(&self, scope: &TenantScope, key: K) -> Result<Option<Record>> {
        self.find_unique_with(scope, key, SelectQuery::new()).await
    }

    /// Like [`find_unique`](Self::find_unique) with a custom projection or
    /// includes
    pub async fn find_unique_with<K: Serialize>(
        &self,
        scope: &TenantScope,
        key: K,
        query: SelectQuery<E>,
    ) -> Result<Option<Record>> {
        let key = to_value(key)?;
        if key.is_null() {
            return Err(Error::ValidationError(format!(
                "find_unique on {} requires a non-null key",
                E::TABLE
            )));
        }
        let query = query.filter(Filter::eq(E::PRIMARY_KEY, key)).limit(1);
        let statement = query.build(scope)?;
        let ctx = self.context("find_unique", scope);
        let rows = self.executor.fetch(&ctx, &statement).await?;
        verify_tenant(scope, E::TENANT_COLUMN.name(), E::TABLE, &rows)?;
        let rows = self.resolve_includes(scope, &query, rows).await?;
        Ok(rows.into_iter().next())
    }

    #[instrument(
        skip(self, scope, filter),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = E::TABLE,
            tenant_id = %scope
        )
    )]
    pub async fn count(&self, scope: &TenantScope, filter: Filter<E::Column>) -> Result<u64> {
        let statement = SelectQuery::<E>::new().filter(filter).build_count(scope)?;
        let ctx = self.context("count", scope);
        let rows = self.executor.fetch(&ctx, &statement).await?;
        count_of(&rows)
    }

    /// Grouped aggregates; each row holds the group columns and one field
    /// per aggregate (`count`, `sum_<column>`, ...)
    #[instrument(
        skip(self, scope, query),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = E::TABLE,
            tenant_id = %scope
        )
    )]
    pub async fn aggregate(&self, scope: &TenantScope, query: AggregateQuery<E>) -> Result<Vec<Record>> {
        let statement = query.build(scope)?;
        let ctx = self.context("aggregate", scope);
        self.executor.fetch(&ctx, &statement).await
    }

    /// Insert rows owned by the scope's tenant. Large inputs are split into
    /// several statements run in one transaction.
    #[instrument(
        skip(self, scope, rows),
        fields(
            db.system = "postgresql",
            db.operation = "INSERT",
            db.sql.table = E::TABLE,
            tenant_id = %scope,
            rows = rows.len()
        )
    )]
    pub async fn create_many(&self, scope: &TenantScope, rows: &[E], skip_duplicates: bool) -> Result<u64> {
        let insert = InsertQuery::new(rows)?.skip_duplicates(skip_duplicates);
        if insert.is_empty() {
            return Ok(0);
        }
        let statements = insert.build_batches(scope)?;
        let ctx = self.context("create_many", scope);
        self.executor.execute_batch(&ctx, &statements).await
    }

    #[instrument(
        skip(self, scope, update),
        fields(
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.sql.table = E::TABLE,
            tenant_id = %scope
        )
    )]
    pub async fn update_many(&self, scope: &TenantScope, update: UpdateQuery<E>) -> Result<u64> {
        let statement = update.build(scope)?;
        let ctx = self.context("update_many", scope);
        self.executor.execute(&ctx, &statement).await
    }

    #[instrument(
        skip(self, scope, delete),
        fields(
            db.system = "postgresql",
            db.operation = "DELETE",
            db.sql.table = E::TABLE,
            tenant_id = %scope
        )
    )]
    pub async fn delete_many(&self, scope: &TenantScope, delete: DeleteQuery<E>) -> Result<u64> {
        let statement = delete.build(scope)?;
        let ctx = self.context("delete_many", scope);
        self.executor.execute(&ctx, &statement).await
    }

    /// Fetch each included relation with one scoped query and nest the
    /// results under the relation name
    async fn resolve_includes(
        &self,
        scope: &TenantScope,
        query: &SelectQuery<E>,
        mut rows: Vec<Record>,
    ) -> Result<Vec<Record>> {
        let relations = query.relations()?;
        if relations.is_empty() || rows.is_empty() {
            return Ok(rows);
        }

        for relation in relations {
            let mut keys: Vec<Value> = Vec::new();
            for row in &rows {
                if let Some(key) = row.get(relation.local_column.name).filter(|v| !v.is_null()) {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
            }

            let related = if keys.is_empty() {
                Vec::new()
            } else {
                let statement = select_related(scope, relation, keys)?;
                let ctx = self.context(&format!("include.{}", relation.name), scope);
                let related = self.executor.fetch(&ctx, &statement).await?;
                verify_tenant(scope, relation.tenant_column.name, relation.table, &related)?;
                related
            };
            nest(&mut rows, relation, related);
        }
        Ok(rows)
    }
}

fn nest(rows: &mut [Record], relation: &Relation, related: Vec<Record>) {
    let mut by_key: HashMap<String, Vec<Record>> = HashMap::new();
    for record in related {
        if let Some(key) = record.get(relation.foreign_column.name) {
            by_key.entry(key.to_string()).or_default().push(record);
        }
    }

    for row in rows.iter_mut() {
        let matches = row
            .get(relation.local_column.name)
            .filter(|v| !v.is_null())
            .and_then(|key| by_key.get(&key.to_string()));
        let nested = match relation.kind {
            RelationKind::BelongsTo => matches
                .and_then(|m| m.first())
                .map(|r| Value::Object(r.clone()))
                .unwrap_or(Value::Null),
            RelationKind::HasMany => Value::Array(
                matches
                    .map(|m| m.iter().cloned().map(Value::Object).collect())
                    .unwrap_or_default(),
            ),
        };
        row.insert(relation.name.to_string(), nested);
    }
}

/// Reject rows that do not belong to the scope's tenant
fn verify_tenant(scope: &TenantScope, tenant_column: &str, table: &str, rows: &[Record]) -> Result<()> {
    let Some(tenant) = scope.tenant_id() else {
        return Ok(());
    };
    for row in rows {
        let owner = row.get(tenant_column).and_then(|v| v.as_str());
        if owner != Some(tenant.as_str()) {
            error!(
                table = %table,
                tenant_id = %tenant,
                row_tenant = ?owner,
                "Row outside tenant scope returned by datastore"
            );
            return Err(Error::TenantViolation(format!(
                "{} returned a row for tenant {:?} to tenant {}",
                table, owner, tenant
            )));
        }
    }
    Ok(())
}

fn count_of(rows: &[Record]) -> Result<u64> {
    rows.first()
        .and_then(|row| row.get("count"))
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .ok_or_else(|| Error::Internal("count query returned no count".to_string()))
}

/// Fluent query over one entity
///
/// ```ignore
/// let open = repo
///     .query()
///     .tenant_scope(TenantScope::tenant("hotel-a"))
///     .filter(Filter::eq(ServiceRequestColumn::Status, "open"))
///     .order_by(ServiceRequestColumn::Priority, SortOrder::Desc)
///     .limit(20)
///     .execute()
///     .await?;
/// ```
pub struct QueryBuilder<E: Entity> {
    repository: Repository<E>,
    query: SelectQuery<E>,
    scope: Option<TenantScope>,
}

impl<E: Entity> QueryBuilder<E> {
    /// Add a `where` predicate; repeated calls are ANDed
    pub fn filter(mut self, filter: Filter<E::Column>) -> Self {
        self.query = self.query.filter(filter);
        self
    }

    pub fn select(mut self, columns: impl IntoIterator<Item = E::Column>) -> Self {
        self.query = self.query.select(columns);
        self
    }

    pub fn select_all(mut self) -> Self {
        self.query = self.query.select_all();
        self
    }

    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.query = self.query.include(relation);
        self
    }

    pub fn order_by(mut self, column: E::Column, order: SortOrder) -> Self {
        self.query = self.query.order_by(column, order);
        self
    }

    pub fn tenant_scope(mut self, scope: TenantScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// See [`Repository::with_context`]
    pub fn with_context(mut self, caller: OperationContext) -> Self {
        self.repository = self.repository.with_context(caller);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.query = self.query.limit(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.query = self.query.offset(offset);
        self
    }

    fn scope(&self) -> Result<&TenantScope> {
        self.scope.as_ref().ok_or_else(|| {
            Error::ValidationError(format!(
                "query on {} requires a tenant scope",
                E::TABLE
            ))
        })
    }

    pub async fn execute(self) -> Result<Vec<Record>> {
        let scope = self.scope()?;
        self.repository.find_many(scope, self.query.clone()).await
    }

    /// Execute and decode into `T`
    pub async fn execute_as<T: DeserializeOwned>(self) -> Result<Vec<T>> {
        decode(self.execute().await?)
    }

    pub async fn first(self) -> Result<Option<Record>> {
        let scope = self.scope()?;
        let rows = self
            .repository
            .find_many(scope, self.query.clone().limit(1))
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn count(self) -> Result<u64> {
        let scope = self.scope()?;
        self.repository
            .count(scope, self.query.filter_ref().clone())
            .await
    }

    /// Page through the query; `limit`/`offset` set on the builder are
    /// replaced by the page's
    pub async fn paginate(self, page: u64, limit: u64) -> Result<Page<Record>> {
        let scope = self.scope()?;
        self.repository
            .find_many_paginated(scope, self.query.clone(), PageRequest::new(page, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Connection, ConnectionFactory};
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::handler::ErrorHandler;
    use crate::models::{Guest, GuestColumn, ServiceRequest};
    use crate::optimizer::{OptimizerConfig, QueryOptimizer};
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::query::{Plan, Statement};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    type Responder = dyn Fn(&Statement) -> Result<Vec<Record>> + Send + Sync;

    struct ScriptedConnection {
        responder: Arc<Responder>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn fetch(&mut self, statement: &Statement) -> Result<Vec<Record>> {
            self.log.lock().push(statement.sql().to_string());
            (self.responder)(statement)
        }
        async fn execute(&mut self, statement: &Statement) -> Result<u64> {
            self.log.lock().push(statement.sql().to_string());
            Ok(1)
        }
        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ScriptedFactory {
        responder: Arc<Responder>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ConnectionFactory for ScriptedFactory {
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            Ok(Box::new(ScriptedConnection {
                responder: self.responder.clone(),
                log: self.log.clone(),
            }))
        }
    }

    fn record(value: serde_json::Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn repository<E: Entity>(
        responder: impl Fn(&Statement) -> Result<Vec<Record>> + Send + Sync + 'static,
    ) -> (Repository<E>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = ScriptedFactory {
            responder: Arc::new(responder),
            log: log.clone(),
        };
        let pool = ConnectionPool::new(
            Arc::new(factory),
            PoolConfig {
                max_connections: 4,
                min_connections: 0,
                ..Default::default()
            },
        )
        .unwrap();
        let executor = QueryExecutor::new(
            pool,
            Arc::new(ErrorHandler::new(
                RetryPolicy {
                    max_attempts: 1,
                    ..Default::default()
                },
                CircuitBreakerConfig::default(),
            )),
            Arc::new(QueryOptimizer::new(OptimizerConfig::default())),
            Duration::from_secs(5),
        );
        (Repository::new(executor), log)
    }

    #[test]
    fn test_page_request_validation() {
        assert!(PageRequest::new(1, 20).validate().is_ok());
        assert!(PageRequest::new(0, 20).validate().is_err());
        assert!(PageRequest::new(1, 0).validate().is_err());
        assert!(PageRequest::new(1, 101).validate().is_err());
        assert_eq!(PageRequest::new(3, 20).offset(), 40);
    }

    #[test]
    fn test_pagination_math() {
        let p = Pagination::new(PageRequest::new(2, 10), 25);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next);
        assert!(p.has_prev);

        let empty = Pagination::new(PageRequest::new(1, 10), 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);
        assert!(!empty.has_prev);

        let json = serde_json::to_value(p).unwrap();
        assert_eq!(json["totalPages"], 3);
        assert_eq!(json["hasNext"], true);
    }

    #[tokio::test]
    async fn test_find_many_rejects_foreign_rows() {
        let (repo, _) = repository::<Guest>(|_| {
            Ok(vec![
                record(json!({"id": "g1", "tenant_id": "hotel-a"})),
                record(json!({"id": "g2", "tenant_id": "hotel-b"})),
            ])
        });

        let err = repo
            .find_many(&TenantScope::tenant("hotel-a"), SelectQuery::new())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::TenantViolation(_)));

        let rows = repo
            .find_many(&TenantScope::elevated("nightly audit"), SelectQuery::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_caller_context_reaches_classified_error() {
        let (repo, _) = repository::<Guest>(|_| Err(Error::ConnectionFailed("refused".into())));
        let caller = OperationContext::new("front-desk.lookup")
            .with_user("staff-7")
            .with_trace_id("trace-42");

        let err = repo
            .clone()
            .with_context(caller.clone())
            .find_many(&TenantScope::tenant("hotel-a"), SelectQuery::new())
            .await
            .unwrap_err();
        match err {
            Error::Classified(classified) => {
                assert_eq!(classified.context.user_id.as_deref(), Some("staff-7"));
                assert_eq!(classified.context.trace_id, "trace-42");
                assert_eq!(classified.context.operation, "guests.find_many");
                assert_eq!(classified.context.tenant_label(), "hotel-a");
            }
            other => panic!("expected classified error, got {:?}", other),
        }

        let err = repo
            .query()
            .tenant_scope(TenantScope::tenant("hotel-b"))
            .with_context(caller)
            .count()
            .await
            .unwrap_err();
        match err {
            Error::Classified(classified) => {
                assert_eq!(classified.context.user_id.as_deref(), Some("staff-7"));
                assert_eq!(classified.context.trace_id, "trace-42");
                assert_eq!(classified.context.tenant_label(), "hotel-b");
            }
            other => panic!("expected classified error, got {:?}", other),
        }

        // Without a caller every operation gets its own trace
        let err = repo
            .find_many(&TenantScope::tenant("hotel-a"), SelectQuery::new())
            .await
            .unwrap_err();
        match err {
            Error::Classified(classified) => {
                assert!(classified.context.user_id.is_none());
                assert_ne!(classified.context.trace_id, "trace-42");
            }
            other => panic!("expected classified error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_find_unique_rejects_unbindable_key() {
        let (repo, log) = repository::<Guest>(|_| Ok(Vec::new()));
        let scope = TenantScope::tenant("hotel-a");

        let mut composite = HashMap::new();
        composite.insert((1u8, 2u8), "room");
        let err = repo.find_unique(&scope, composite).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));

        let err = repo.find_unique(&scope, Option::<String>::None).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_paginated_runs_page_and_count() {
        let (repo, log) = repository::<Guest>(|statement| match statement.plan() {
            Plan::Count { .. } => Ok(vec![record(json!({"count": 45}))]),
            _ => Ok(vec![record(json!({"id": "g1", "tenant_id": "hotel-a"}))]),
        });

        let page = repo
            .find_many_paginated(
                &TenantScope::tenant("hotel-a"),
                SelectQuery::new().filter(Filter::eq(GuestColumn::LoyaltyTier, "gold")),
                PageRequest::new(2, 20),
            )
            .await
            .unwrap();

        assert_eq!(page.data.len(), 1);
        assert_eq!(page.pagination.total, 45);
        assert_eq!(page.pagination.total_pages, 3);
        assert!(page.pagination.has_next);

        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert!(log.iter().any(|sql| sql.contains("LIMIT 20 OFFSET 20")));
        assert!(log.iter().any(|sql| sql.starts_with("SELECT COUNT(*)")));
    }

    #[tokio::test]
    async fn test_include_nests_related_records() {
        let (repo, log) = repository::<ServiceRequest>(|statement| {
            if statement.table() == Some("guests") {
                Ok(vec![record(json!({
                    "id": "g1", "tenant_id": "hotel-a", "first_name": "Ada", "last_name": "Byron"
                }))])
            } else {
                Ok(vec![
                    record(json!({"id": "r1", "tenant_id": "hotel-a", "guest_id": "g1"})),
                    record(json!({"id": "r2", "tenant_id": "hotel-a", "guest_id": null})),
                ])
            }
        });

        let rows = repo
            .find_many(
                &TenantScope::tenant("hotel-a"),
                SelectQuery::new().include("guest"),
            )
            .await
            .unwrap();

        assert_eq!(rows[0]["guest"]["first_name"], "Ada");
        assert_eq!(rows[1]["guest"], Value::Null);
        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert!(log[1].contains("FROM \"guests\""));
        assert!(log[1].contains("\"tenant_id\""));
    }

    #[tokio::test]
    async fn test_builder_requires_scope() {
        let (repo, log) = repository::<Guest>(|_| Ok(Vec::new()));
        let err = repo.query().limit(5).execute().await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert!(log.lock().is_empty());

        let first = repo
            .query()
            .tenant_scope(TenantScope::tenant("hotel-a"))
            .first()
            .await
            .unwrap();
        assert!(first.is_none());
    }

    #[test]
    fn test_decode_reports_missing_fields() {
        let rows = vec![record(json!({"id": "not-a-uuid"}))];
        assert!(decode::<Guest>(rows).is_err());
    }
}
