//! In-memory datastore for testing without PostgreSQL
//!
//! [`MemoryDatastore`] implements the storage crate's connection traits by
//! evaluating each statement's [`Plan`] against tables held in memory. It
//! honors the tenant predicate the query builder emits, emulates row-level
//! security for sessions that set `app.current_tenant`, and supports
//! transactions, fault injection and latency.
//!
//! # Example
//!
//! ```ignore
//! use concierge_tests::mocks::{Fault, MemoryDatastore};
//!
//! #[tokio::test]
//! async fn test_retry_on_reset() {
//!     let store = MemoryDatastore::new();
//!     store.inject_fault(Fault::ConnectionReset, 2);
//!
//!     let pool = ConnectionPool::connect(store.factory(), PoolConfig::default()).await?;
//!     // ...
//! }
//! ```

use async_trait::async_trait;
use concierge_storage::entity::{ColumnRef, Entity};
use concierge_storage::query::{
    compare_values, Aggregate, AggregateFn, AggregatePlan, InsertPlan, OrderBy, Plan, SelectPlan,
    UpdatePlan,
};
use concierge_storage::{Connection, ConnectionFactory, Error, Record, Result, SortOrder, Statement};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type Tables = BTreeMap<String, Vec<Record>>;

/// Failure returned by the next statements after [`MemoryDatastore::inject_fault`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection dropped mid-statement (retryable)
    ConnectionReset,
    /// Statement cancelled by the server (retryable)
    StatementTimeout,
    /// Unique key violation (not retryable)
    UniqueViolation,
}

impl Fault {
    fn to_error(self) -> Error {
        match self {
            Fault::ConnectionReset => Error::ConnectionFailed("connection reset by peer".into()),
            Fault::StatementTimeout => {
                Error::Timeout("canceling statement due to statement timeout".into())
            }
            Fault::UniqueViolation => Error::AlreadyExists("duplicate key value".into()),
        }
    }
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    faults: Mutex<Option<(Fault, u32)>>,
    latency: Mutex<Duration>,
    refuse_connects: AtomicBool,
    unhealthy: AtomicBool,
    /// Rows appended to every select on a table, whatever the filter
    rogue_rows: Mutex<BTreeMap<String, Vec<Record>>>,
    log: Mutex<Vec<Statement>>,
    opened: AtomicU32,
    closed: AtomicU32,
    peak_live: AtomicU32,
}

impl Inner {
    fn live(&self) -> u32 {
        self.opened
            .load(AtomicOrdering::SeqCst)
            .saturating_sub(self.closed.load(AtomicOrdering::SeqCst))
    }

    fn take_fault(&self) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let (fault, remaining) = faults.as_mut()?;
        let fault = *fault;
        *remaining -= 1;
        if *remaining == 0 {
            *faults = None;
        }
        Some(fault)
    }
}

/// Shared handle to an in-memory datastore
#[derive(Clone, Default)]
pub struct MemoryDatastore {
    inner: Arc<Inner>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection factory to hand to a pool or data layer
    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }

    /// Insert raw rows into `table`, bypassing the query builder
    pub fn insert_records(&self, table: &str, rows: impl IntoIterator<Item = Record>) {
        self.inner
            .tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Seed `E::TABLE` with serialized entities
    pub fn seed<E: Entity>(&self, rows: &[E]) {
        let records = rows.iter().filter_map(|row| match serde_json::to_value(row) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        });
        self.insert_records(E::TABLE, records);
    }

    /// Current contents of `table`
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.inner
            .tables
            .lock()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Fail the next `times` planned statements with `fault`. Transaction
    /// control and session statements are not affected.
    pub fn inject_fault(&self, fault: Fault, times: u32) {
        *self.inner.faults.lock() = if times == 0 {
            None
        } else {
            Some((fault, times))
        };
    }

    /// Delay every statement by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner
            .refuse_connects
            .store(refuse, AtomicOrdering::SeqCst);
    }

    /// Make health-check pings fail
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.inner.unhealthy.store(unhealthy, AtomicOrdering::SeqCst);
    }

    /// Return `row` from every select against `table`, simulating a
    /// datastore that ignores the tenant predicate
    pub fn leak_row(&self, table: &str, row: Record) {
        self.inner
            .rogue_rows
            .lock()
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Every statement received, in order
    pub fn statements(&self) -> Vec<Statement> {
        self.inner.log.lock().clone()
    }

    pub fn sql_log(&self) -> Vec<String> {
        self.inner
            .log
            .lock()
            .iter()
            .map(|s| s.sql().to_string())
            .collect()
    }

    /// Statements whose plan targets `table`
    pub fn statements_for(&self, table: &str) -> Vec<Statement> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|s| s.table() == Some(table))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }

    pub fn opened(&self) -> u32 {
        self.inner.opened.load(AtomicOrdering::SeqCst)
    }

    /// Connections opened and not yet closed
    pub fn live_connections(&self) -> u32 {
        self.inner.live()
    }

    pub fn peak_connections(&self) -> u32 {
        self.inner.peak_live.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryDatastore {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        if self.inner.refuse_connects.load(AtomicOrdering::SeqCst) {
            return Err(Error::ConnectionFailed("connection refused".into()));
        }
        self.inner.opened.fetch_add(1, AtomicOrdering::SeqCst);
        self.inner
            .peak_live
            .fetch_max(self.inner.live(), AtomicOrdering::SeqCst);
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
            transaction: None,
            session_tenant: None,
            closed: false,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    /// Working copy of the tables while a transaction is open
    transaction: Option<Tables>,
    /// `app.current_tenant` for the current transaction
    session_tenant: Option<String>,
    closed: bool,
}

enum Outcome {
    Rows(Vec<Record>),
    Affected(u64),
}

impl MemoryConnection {
    async fn run(&mut self, statement: &Statement) -> Result<Outcome> {
        if self.closed {
            return Err(Error::ConnectionFailed("connection is closed".into()));
        }
        self.inner.log.lock().push(statement.clone());
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Plan::Raw = statement.plan() {
            return Ok(self.raw(statement));
        }
        if let Some(fault) = self.inner.take_fault() {
            debug!(?fault, sql = %statement.sql(), "Injecting datastore fault");
            return Err(fault.to_error());
        }

        let rogue = match statement.plan() {
            Plan::Select(p) => self
                .inner
                .rogue_rows
                .lock()
                .get(p.table)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let tenant = self.session_tenant.clone();
        let outcome = match self.transaction.as_mut() {
            Some(tables) => evaluate(tables, statement.plan(), tenant.as_deref()),
            None => {
                let mut tables = self.inner.tables.lock();
                evaluate(&mut tables, statement.plan(), tenant.as_deref())
            }
        }?;
        Ok(match outcome {
            Outcome::Rows(mut rows) => {
                rows.extend(rogue);
                Outcome::Rows(rows)
            }
            affected => affected,
        })
    }

    /// Transaction control, session settings and probes
    fn raw(&mut self, statement: &Statement) -> Outcome {
        let sql = statement.sql().trim().to_ascii_uppercase();
        match sql.as_str() {
            "BEGIN" => {
                self.transaction = Some(self.inner.tables.lock().clone());
                return Outcome::Affected(0);
            }
            "COMMIT" => {
                if let Some(tables) = self.transaction.take() {
                    *self.inner.tables.lock() = tables;
                }
                self.session_tenant = None;
                return Outcome::Affected(0);
            }
            "ROLLBACK" => {
                self.transaction = None;
                self.session_tenant = None;
                return Outcome::Affected(0);
            }
            _ => {}
        }

        if sql.contains("SET_CONFIG('APP.CURRENT_TENANT'") {
            let tenant = statement
                .params()
                .first()
                .and_then(|v| v.as_str())
                .map(str::to_string);
            // Transaction-local, like set_config(..., true)
            if self.transaction.is_some() {
                self.session_tenant = tenant.clone();
            }
            return Outcome::Rows(vec![record(json!({ "set_config": tenant }))]);
        }
        if sql.contains("PG_DATABASE_SIZE") {
            let tables = self.inner.tables.lock();
            let size: usize = tables
                .values()
                .flatten()
                .map(|row| Value::Object(row.clone()).to_string().len())
                .sum();
            return Outcome::Rows(vec![record(json!({
                "database_size_bytes": size as i64,
                "table_count": tables.len() as i64,
            }))]);
        }
        if sql.contains("VERSION()") {
            return Outcome::Rows(vec![record(json!({ "version": "memory datastore" }))]);
        }
        Outcome::Rows(vec![record(json!({ "?column?": 1 }))])
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn fetch(&mut self, statement: &Statement) -> Result<Vec<Record>> {
        match self.run(statement).await? {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Affected(_) => Ok(Vec::new()),
        }
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        match self.run(statement).await? {
            Outcome::Rows(rows) => Ok(rows.len() as u64),
            Outcome::Affected(n) => Ok(n),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        if self.closed || self.inner.unhealthy.load(AtomicOrdering::SeqCst) {
            return Err(Error::ConnectionFailed("ping failed".into()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.inner.closed.fetch_add(1, AtomicOrdering::SeqCst);
        }
        Ok(())
    }
}

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

fn evaluate(tables: &mut Tables, plan: &Plan, session_tenant: Option<&str>) -> Result<Outcome> {
    // Row-level security: a session tenant hides other tenants' rows
    let visible = |row: &Record| match session_tenant {
        Some(tenant) => row.get("tenant_id").and_then(|v| v.as_str()) == Some(tenant),
        None => true,
    };

    match plan {
        Plan::Select(p) => {
            let rows = tables.get(p.table).map(Vec::as_slice).unwrap_or_default();
            Ok(Outcome::Rows(select(rows, p, visible)))
        }
        Plan::Count { table, filter } => {
            let count = tables
                .get(*table)
                .map(|rows| rows.iter().filter(|&r| visible(r) && filter.matches(r)).count())
                .unwrap_or(0);
            Ok(Outcome::Rows(vec![record(json!({ "count": count }))]))
        }
        Plan::Aggregate(p) => {
            let rows = tables.get(p.table).map(Vec::as_slice).unwrap_or_default();
            Ok(Outcome::Rows(aggregate(rows, p, visible)))
        }
        Plan::Insert(p) => insert(tables.entry(p.table.to_string()).or_default(), p, session_tenant),
        Plan::Update(p) => Ok(Outcome::Affected(update(
            tables.entry(p.table.to_string()).or_default(),
            p,
            visible,
        ))),
        Plan::Delete { table, filter } => {
            let rows = tables.entry(table.to_string()).or_default();
            let before = rows.len();
            rows.retain(|r| !(visible(r) && filter.matches(r)));
            Ok(Outcome::Affected((before - rows.len()) as u64))
        }
        Plan::Raw => Ok(Outcome::Affected(0)),
    }
}

fn select(rows: &[Record], plan: &SelectPlan, visible: impl Fn(&Record) -> bool) -> Vec<Record> {
    let mut matched: Vec<&Record> = rows
        .iter()
        .filter(|&r| visible(r) && plan.filter.matches(r))
        .collect();
    matched.sort_by(|a, b| compare_rows(a, b, &plan.order_by));

    let offset = plan.offset.unwrap_or(0) as usize;
    let limit = plan.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    matched
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|row| project(row, plan.columns.as_deref()))
        .collect()
}

fn project(row: &Record, columns: Option<&[ColumnRef]>) -> Record {
    match columns {
        None => row.clone(),
        Some(columns) => columns
            .iter()
            .map(|c| {
                (
                    c.name.to_string(),
                    row.get(c.name).cloned().unwrap_or(Value::Null),
                )
            })
            .collect(),
    }
}

/// PostgreSQL ordering: NULLs sort last ascending and first descending
fn compare_rows(a: &Record, b: &Record, order_by: &[OrderBy<ColumnRef>]) -> Ordering {
    for key in order_by {
        let left = a.get(key.column.name).unwrap_or(&Value::Null);
        let right = b.get(key.column.name).unwrap_or(&Value::Null);
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => compare_values(left, right).unwrap_or(Ordering::Equal),
        };
        let ordering = match key.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn aggregate(rows: &[Record], plan: &AggregatePlan, visible: impl Fn(&Record) -> bool) -> Vec<Record> {
    let mut groups: Vec<(Vec<Value>, Vec<&Record>)> = Vec::new();
    for row in rows.iter().filter(|&r| visible(r) && plan.filter.matches(r)) {
        let key: Vec<Value> = plan
            .group_by
            .iter()
            .map(|c| row.get(c.name).cloned().unwrap_or(Value::Null))
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(row),
            None => groups.push((key, vec![row])),
        }
    }
    // Without GROUP BY an empty input still yields one row
    if groups.is_empty() && plan.group_by.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }
    groups.sort_by(|(a, _), (b, _)| {
        a.iter()
            .zip(b)
            .map(|(x, y)| compare_values(x, y).unwrap_or(Ordering::Equal))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut out: Record = plan
                .group_by
                .iter()
                .zip(key)
                .map(|(c, v)| (c.name.to_string(), v))
                .collect();
            for agg in &plan.aggregates {
                out.insert(agg.alias(), aggregate_value(agg, &members));
            }
            out
        })
        .collect()
}

fn aggregate_value(agg: &Aggregate, members: &[&Record]) -> Value {
    let Some(column) = agg.column else {
        return json!(members.len());
    };
    let values: Vec<&Value> = members
        .iter()
        .filter_map(|r| r.get(column.name))
        .filter(|v| !v.is_null())
        .collect();

    match agg.function {
        AggregateFn::Count => json!(values.len()),
        AggregateFn::Sum if values.is_empty() => Value::Null,
        AggregateFn::Sum => {
            if values.iter().all(|v| v.is_i64()) {
                json!(values.iter().filter_map(|v| v.as_i64()).sum::<i64>())
            } else {
                json!(values.iter().filter_map(|v| v.as_f64()).sum::<f64>())
            }
        }
        AggregateFn::Avg if values.is_empty() => Value::Null,
        AggregateFn::Avg => {
            let sum: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
            json!(sum / values.len() as f64)
        }
        AggregateFn::Min | AggregateFn::Max => {
            let wanted = if agg.function == AggregateFn::Min {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            values
                .into_iter()
                .fold(None::<&Value>, |best, v| match best {
                    Some(b) if compare_values(v, b) != Some(wanted) => Some(b),
                    _ => Some(v),
                })
                .cloned()
                .unwrap_or(Value::Null)
        }
    }
}

fn insert(table: &mut Vec<Record>, plan: &InsertPlan, session_tenant: Option<&str>) -> Result<Outcome> {
    let key_of = |row: &Record| row.get("id").cloned().unwrap_or(Value::Null);
    let mut pending: Vec<Record> = Vec::with_capacity(plan.rows.len());
    for values in &plan.rows {
        let row: Record = plan
            .columns
            .iter()
            .zip(values)
            .map(|(c, v)| (c.name.to_string(), v.clone()))
            .collect();

        if let Some(tenant) = session_tenant {
            if row.get("tenant_id").and_then(|v| v.as_str()) != Some(tenant) {
                return Err(Error::TenantViolation(format!(
                    "new row violates row-level security policy for table \"{}\"",
                    plan.table
                )));
            }
        }

        let key = key_of(&row);
        let duplicate = !key.is_null()
            && (table.iter().any(|r| key_of(r) == key) || pending.iter().any(|r| key_of(r) == key));
        if duplicate {
            if plan.skip_duplicates {
                continue;
            }
            return Err(Error::AlreadyExists(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                plan.table
            )));
        }
        pending.push(row);
    }
    let inserted = pending.len() as u64;
    table.extend(pending);
    Ok(Outcome::Affected(inserted))
}

fn update(table: &mut [Record], plan: &UpdatePlan, visible: impl Fn(&Record) -> bool) -> u64 {
    let mut affected = 0;
    for row in table.iter_mut() {
        if visible(row) && plan.filter.matches(row) {
            for (column, value) in &plan.assignments {
                row.insert(column.name.to_string(), value.clone());
            }
            affected += 1;
        }
    }
    affected
}
