//! Tenant-scoped query builder
//!
//! Statements are assembled from typed [`Filter`]s over an entity's column
//! enum and rendered into parameterized PostgreSQL. Every builder goes through
//! [`scoped`], the only place a tenant predicate is attached, so a statement
//! against a tenant-owned table cannot be produced without either a tenant or
//! an explicit [`Elevated`](crate::tenant::Elevated) grant.
//!
//! Alongside the SQL text each [`Statement`] carries its [`Plan`], which
//! in-process datastores evaluate directly with [`Filter::matches`].

use crate::backend::Record;
use crate::entity::{Column, ColumnRef, Entity, Relation, SqlType};
use crate::tenant::TenantScope;
use crate::{Error, Result};
use chrono::DateTime;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::marker::PhantomData;

/// PostgreSQL limit on bind parameters per statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Convert any serializable value into a bindable parameter
pub fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::ValidationError(format!("value cannot be bound as a parameter: {}", e)))
}

/// Comparison applied to a single column
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    /// Case-insensitive substring match
    Contains(String),
    StartsWith(String),
    IsNull,
    IsNotNull,
}

/// Typed predicate over the columns of one entity
#[derive(Debug, Clone, PartialEq)]
pub enum Filter<C> {
    /// Matches every row
    All,
    Field(C, Condition),
    And(Vec<Filter<C>>),
    Or(Vec<Filter<C>>),
    Not(Box<Filter<C>>),
}

impl<C> Default for Filter<C> {
    fn default() -> Self {
        Filter::All
    }
}

impl<C: Column> Filter<C> {
    pub fn eq(column: C, value: impl Into<Value>) -> Self {
        Filter::Field(column, Condition::Eq(value.into()))
    }

    pub fn ne(column: C, value: impl Into<Value>) -> Self {
        Filter::Field(column, Condition::Ne(value.into()))
    }

    pub fn gt(column: C, value: impl Into<Value>) -> Self {
        Filter::Field(column, Condition::Gt(value.into()))
    }

    pub fn gte(column: C, value: impl Into<Value>) -> Self {
        Filter::Field(column, Condition::Gte(value.into()))
    }

    pub fn lt(column: C, value: impl Into<Value>) -> Self {
        Filter::Field(column, Condition::Lt(value.into()))
    }

    pub fn lte(column: C, value: impl Into<Value>) -> Self {
        Filter::Field(column, Condition::Lte(value.into()))
    }

    pub fn is_in<V: Into<Value>>(column: C, values: impl IntoIterator<Item = V>) -> Self {
        Filter::Field(
            column,
            Condition::In(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn not_in<V: Into<Value>>(column: C, values: impl IntoIterator<Item = V>) -> Self {
        Filter::Field(
            column,
            Condition::NotIn(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn contains(column: C, needle: impl Into<String>) -> Self {
        Filter::Field(column, Condition::Contains(needle.into()))
    }

    pub fn starts_with(column: C, prefix: impl Into<String>) -> Self {
        Filter::Field(column, Condition::StartsWith(prefix.into()))
    }

    pub fn is_null(column: C) -> Self {
        Filter::Field(column, Condition::IsNull)
    }

    pub fn is_not_null(column: C) -> Self {
        Filter::Field(column, Condition::IsNotNull)
    }

    /// Conjunction, flattening nested `And`s. `All` is the identity.
    pub fn and(self, other: Filter<C>) -> Filter<C> {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    /// Disjunction, flattening nested `Or`s. `All` absorbs.
    pub fn or(self, other: Filter<C>) -> Filter<C> {
        match (self, other) {
            (Filter::All, _) | (_, Filter::All) => Filter::All,
            (Filter::Or(mut a), Filter::Or(b)) => {
                a.extend(b);
                Filter::Or(a)
            }
            (Filter::Or(mut a), f) => {
                a.push(f);
                Filter::Or(a)
            }
            (f, Filter::Or(mut b)) => {
                b.insert(0, f);
                Filter::Or(b)
            }
            (a, b) => Filter::Or(vec![a, b]),
        }
    }

    pub fn negate(self) -> Filter<C> {
        match self {
            Filter::Not(inner) => *inner,
            other => Filter::Not(Box::new(other)),
        }
    }

    /// Columns referenced anywhere in the filter
    pub fn columns(&self) -> Vec<C> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<C>) {
        match self {
            Filter::All => {}
            Filter::Field(c, _) => {
                if !out.contains(c) {
                    out.push(*c);
                }
            }
            Filter::And(fs) | Filter::Or(fs) => fs.iter().for_each(|f| f.collect_columns(out)),
            Filter::Not(f) => f.collect_columns(out),
        }
    }

    /// Erase the entity column type
    pub fn lower(&self) -> Filter<ColumnRef> {
        match self {
            Filter::All => Filter::All,
            Filter::Field(c, cond) => Filter::Field(ColumnRef::of(*c), cond.clone()),
            Filter::And(fs) => Filter::And(fs.iter().map(|f| f.lower()).collect()),
            Filter::Or(fs) => Filter::Or(fs.iter().map(|f| f.lower()).collect()),
            Filter::Not(f) => Filter::Not(Box::new(f.lower())),
        }
    }

    /// Evaluate the filter against a row. Missing columns read as NULL, and
    /// comparisons against NULL never match (as in SQL).
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Field(column, condition) => {
                let value = record.get(column.name()).unwrap_or(&Value::Null);
                condition_matches(condition, value)
            }
            Filter::And(fs) => fs.iter().all(|f| f.matches(record)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(record)),
            Filter::Not(f) => !f.matches(record),
        }
    }
}

fn condition_matches(condition: &Condition, value: &Value) -> bool {
    match condition {
        Condition::IsNull => value.is_null(),
        Condition::IsNotNull => !value.is_null(),
        Condition::Eq(Value::Null) => value.is_null(),
        Condition::Ne(Value::Null) => !value.is_null(),
        _ if value.is_null() => false,
        Condition::Eq(expected) => values_equal(value, expected),
        Condition::Ne(expected) => !values_equal(value, expected),
        Condition::Gt(bound) => compare_values(value, bound) == Some(Ordering::Greater),
        Condition::Gte(bound) => matches!(
            compare_values(value, bound),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Condition::Lt(bound) => compare_values(value, bound) == Some(Ordering::Less),
        Condition::Lte(bound) => matches!(
            compare_values(value, bound),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Condition::In(options) => options.iter().any(|o| values_equal(value, o)),
        Condition::NotIn(options) => !options.iter().any(|o| values_equal(value, o)),
        Condition::Contains(needle) => {
            text_of(value).to_lowercase().contains(&needle.to_lowercase())
        }
        Condition::StartsWith(prefix) => text_of(value).starts_with(prefix.as_str()),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Some(Ordering::Equal)
}

/// Order two column values the way PostgreSQL would for the common scalar
/// types. Timestamps serialized as RFC 3339 strings compare as instants.
/// Returns `None` for NULLs and mismatched types.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(dx), Ok(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy<C> {
    pub column: C,
    pub order: SortOrder,
}

/// Column selection for a read
#[derive(Debug, Clone, PartialEq)]
pub enum Projection<C> {
    /// The entity's allow-listed columns
    Default,
    Columns(Vec<C>),
    /// Every column (`SELECT *`); only accepted together with an include
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFn::Count => "count",
            AggregateFn::Sum => "sum",
            AggregateFn::Avg => "avg",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
        }
    }
}

/// A single aggregate expression; `column` is `None` only for `COUNT(*)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    pub function: AggregateFn,
    pub column: Option<ColumnRef>,
}

impl Aggregate {
    /// Result key, e.g. `count` or `sum_charge_cents`
    pub fn alias(&self) -> String {
        match self.column {
            None => self.function.as_str().to_string(),
            Some(c) => format!("{}_{}", self.function.as_str(), c.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectPlan {
    pub table: &'static str,
    /// `None` selects every column
    pub columns: Option<Vec<ColumnRef>>,
    pub filter: Filter<ColumnRef>,
    pub order_by: Vec<OrderBy<ColumnRef>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePlan {
    pub table: &'static str,
    pub filter: Filter<ColumnRef>,
    pub group_by: Vec<ColumnRef>,
    pub aggregates: Vec<Aggregate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertPlan {
    pub table: &'static str,
    pub columns: Vec<ColumnRef>,
    pub rows: Vec<Vec<Value>>,
    pub skip_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    pub table: &'static str,
    pub assignments: Vec<(ColumnRef, Value)>,
    pub filter: Filter<ColumnRef>,
}

/// Structured form of a statement
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Select(SelectPlan),
    Count {
        table: &'static str,
        filter: Filter<ColumnRef>,
    },
    Aggregate(AggregatePlan),
    Insert(InsertPlan),
    Update(UpdatePlan),
    Delete {
        table: &'static str,
        filter: Filter<ColumnRef>,
    },
    /// Hand-written SQL (transaction control, probes, session settings)
    Raw,
}

impl Plan {
    pub fn table(&self) -> Option<&'static str> {
        match self {
            Plan::Select(p) => Some(p.table),
            Plan::Count { table, .. } | Plan::Delete { table, .. } => Some(*table),
            Plan::Aggregate(p) => Some(p.table),
            Plan::Insert(p) => Some(p.table),
            Plan::Update(p) => Some(p.table),
            Plan::Raw => None,
        }
    }
}

/// A rendered, parameterized statement
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
    plan: Plan,
}

impl Statement {
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            plan: Plan::Raw,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn table(&self) -> Option<&'static str> {
        self.plan.table()
    }

    fn render(plan: Plan) -> Self {
        let mut w = SqlWriter::default();
        match &plan {
            Plan::Select(p) => {
                w.push("SELECT ");
                match &p.columns {
                    None => w.push("*"),
                    Some(cols) => w.column_list(cols),
                }
                w.push(" FROM ");
                w.ident(p.table);
                w.where_clause(&p.filter);
                if !p.order_by.is_empty() {
                    w.push(" ORDER BY ");
                    for (i, o) in p.order_by.iter().enumerate() {
                        if i > 0 {
                            w.push(", ");
                        }
                        w.ident(o.column.name);
                        w.push(" ");
                        w.push(o.order.as_sql());
                    }
                }
                if let Some(limit) = p.limit {
                    let _ = write!(w.sql, " LIMIT {}", limit);
                }
                if let Some(offset) = p.offset {
                    let _ = write!(w.sql, " OFFSET {}", offset);
                }
            }
            Plan::Count { table, filter } => {
                w.push("SELECT COUNT(*) AS \"count\" FROM ");
                w.ident(table);
                w.where_clause(filter);
            }
            Plan::Aggregate(p) => {
                w.push("SELECT ");
                let mut first = true;
                for g in &p.group_by {
                    if !first {
                        w.push(", ");
                    }
                    first = false;
                    w.ident(g.name);
                }
                for a in &p.aggregates {
                    if !first {
                        w.push(", ");
                    }
                    first = false;
                    w.push(&a.function.as_str().to_uppercase());
                    w.push("(");
                    match a.column {
                        None => w.push("*"),
                        Some(c) => w.ident(c.name),
                    }
                    w.push(") AS ");
                    w.ident(&a.alias());
                }
                w.push(" FROM ");
                w.ident(p.table);
                w.where_clause(&p.filter);
                if !p.group_by.is_empty() {
                    w.push(" GROUP BY ");
                    w.column_list(&p.group_by);
                    w.push(" ORDER BY ");
                    w.column_list(&p.group_by);
                }
            }
            Plan::Insert(p) => {
                w.push("INSERT INTO ");
                w.ident(p.table);
                w.push(" (");
                w.column_list(&p.columns);
                w.push(") VALUES ");
                for (i, row) in p.rows.iter().enumerate() {
                    if i > 0 {
                        w.push(", ");
                    }
                    w.push("(");
                    for (j, (value, column)) in row.iter().zip(&p.columns).enumerate() {
                        if j > 0 {
                            w.push(", ");
                        }
                        w.bind(value.clone(), column.sql_type);
                    }
                    w.push(")");
                }
                if p.skip_duplicates {
                    w.push(" ON CONFLICT DO NOTHING");
                }
            }
            Plan::Update(p) => {
                w.push("UPDATE ");
                w.ident(p.table);
                w.push(" SET ");
                for (i, (column, value)) in p.assignments.iter().enumerate() {
                    if i > 0 {
                        w.push(", ");
                    }
                    w.ident(column.name);
                    w.push(" = ");
                    w.bind(value.clone(), column.sql_type);
                }
                w.where_clause(&p.filter);
            }
            Plan::Delete { table, filter } => {
                w.push("DELETE FROM ");
                w.ident(table);
                w.where_clause(filter);
            }
            Plan::Raw => {}
        }
        Self {
            sql: w.sql,
            params: w.params,
            plan,
        }
    }
}

#[derive(Default)]
struct SqlWriter {
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn ident(&mut self, name: &str) {
        self.sql.push('"');
        self.sql.push_str(&name.replace('"', "\"\""));
        self.sql.push('"');
    }

    fn column_list(&mut self, columns: &[ColumnRef]) {
        for (i, c) in columns.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.ident(c.name);
        }
    }

    fn bind(&mut self, value: Value, sql_type: SqlType) {
        self.params.push(value);
        let _ = write!(self.sql, "${}{}", self.params.len(), sql_type.cast());
    }

    fn where_clause(&mut self, filter: &Filter<ColumnRef>) {
        if *filter != Filter::All {
            self.push(" WHERE ");
            self.filter(filter);
        }
    }

    fn filter(&mut self, filter: &Filter<ColumnRef>) {
        match filter {
            Filter::All => self.push("TRUE"),
            Filter::Field(column, condition) => self.condition(*column, condition),
            Filter::And(fs) if fs.is_empty() => self.push("TRUE"),
            Filter::Or(fs) if fs.is_empty() => self.push("FALSE"),
            Filter::And(fs) => self.group(fs, " AND "),
            Filter::Or(fs) => self.group(fs, " OR "),
            Filter::Not(f) => {
                self.push("NOT (");
                self.filter(f);
                self.push(")");
            }
        }
    }

    fn group(&mut self, filters: &[Filter<ColumnRef>], joiner: &str) {
        self.push("(");
        for (i, f) in filters.iter().enumerate() {
            if i > 0 {
                self.push(joiner);
            }
            self.filter(f);
        }
        self.push(")");
    }

    fn comparison(&mut self, column: ColumnRef, op: &str, value: &Value) {
        self.ident(column.name);
        self.push(op);
        self.bind(value.clone(), column.sql_type);
    }

    fn condition(&mut self, column: ColumnRef, condition: &Condition) {
        match condition {
            Condition::Eq(Value::Null) | Condition::IsNull => {
                self.ident(column.name);
                self.push(" IS NULL");
            }
            Condition::Ne(Value::Null) | Condition::IsNotNull => {
                self.ident(column.name);
                self.push(" IS NOT NULL");
            }
            Condition::Eq(v) => self.comparison(column, " = ", v),
            Condition::Ne(v) => self.comparison(column, " <> ", v),
            Condition::Gt(v) => self.comparison(column, " > ", v),
            Condition::Gte(v) => self.comparison(column, " >= ", v),
            Condition::Lt(v) => self.comparison(column, " < ", v),
            Condition::Lte(v) => self.comparison(column, " <= ", v),
            Condition::In(values) if values.is_empty() => self.push("FALSE"),
            Condition::NotIn(values) if values.is_empty() => self.push("TRUE"),
            Condition::In(values) | Condition::NotIn(values) => {
                self.ident(column.name);
                if matches!(condition, Condition::NotIn(_)) {
                    self.push(" NOT");
                }
                self.push(" IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.bind(v.clone(), column.sql_type);
                }
                self.push(")");
            }
            Condition::Contains(needle) => {
                self.ident(column.name);
                self.push("::text ILIKE ");
                self.bind(
                    Value::String(format!("%{}%", escape_like(needle))),
                    SqlType::Text,
                );
            }
            Condition::StartsWith(prefix) => {
                self.ident(column.name);
                self.push("::text LIKE ");
                self.bind(
                    Value::String(format!("{}%", escape_like(prefix))),
                    SqlType::Text,
                );
            }
        }
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Attach the tenant predicate for `scope` to `filter`.
///
/// This is the only constructor of scoped filters; every builder in this
/// module lowers its user filter through it.
fn scoped(
    scope: &TenantScope,
    tenant_column: ColumnRef,
    filter: Filter<ColumnRef>,
) -> Result<Filter<ColumnRef>> {
    match scope {
        TenantScope::Tenant(tenant) => {
            if tenant.as_str().trim().is_empty() {
                return Err(Error::ValidationError(
                    "tenant id must not be empty".to_string(),
                ));
            }
            Ok(Filter::Field(
                tenant_column,
                Condition::Eq(Value::String(tenant.as_str().to_string())),
            )
            .and(filter))
        }
        TenantScope::CrossTenant(_) => Ok(filter),
    }
}

fn scoped_entity_filter<E: Entity>(
    scope: &TenantScope,
    filter: &Filter<E::Column>,
) -> Result<Filter<ColumnRef>> {
    scoped(scope, ColumnRef::of(E::TENANT_COLUMN), filter.lower())
}

fn push_unique(columns: &mut Vec<ColumnRef>, column: ColumnRef) {
    if !columns.contains(&column) {
        columns.push(column);
    }
}

/// Read query against one entity
#[derive(Debug, Clone)]
pub struct SelectQuery<E: Entity> {
    filter: Filter<E::Column>,
    projection: Projection<E::Column>,
    includes: Vec<String>,
    order_by: Vec<OrderBy<E::Column>>,
    limit: Option<u64>,
    offset: Option<u64>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Default for SelectQuery<E> {
    fn default() -> Self {
        Self {
            filter: Filter::All,
            projection: Projection::Default,
            includes: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> SelectQuery<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predicate; repeated calls are ANDed together
    pub fn filter(mut self, filter: Filter<E::Column>) -> Self {
        self.filter = std::mem::take(&mut self.filter).and(filter);
        self
    }

    pub fn select(mut self, columns: impl IntoIterator<Item = E::Column>) -> Self {
        self.projection = Projection::Columns(columns.into_iter().collect());
        self
    }

    /// Select every column. Rejected at build time unless a relation is
    /// also included.
    pub fn select_all(mut self) -> Self {
        self.projection = Projection::All;
        self
    }

    pub fn include(mut self, relation: impl Into<String>) -> Self {
        let relation = relation.into();
        if !self.includes.contains(&relation) {
            self.includes.push(relation);
        }
        self
    }

    pub fn order_by(mut self, column: E::Column, order: SortOrder) -> Self {
        self.order_by.push(OrderBy { column, order });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn filter_ref(&self) -> &Filter<E::Column> {
        &self.filter
    }

    /// Relations requested with [`include`](Self::include)
    pub fn relations(&self) -> Result<Vec<&'static Relation>> {
        self.includes
            .iter()
            .map(|name| {
                E::relation(name).ok_or_else(|| {
                    Error::ValidationError(format!(
                        "unknown relation '{}' on {}",
                        name,
                        E::TABLE
                    ))
                })
            })
            .collect()
    }

    fn columns(&self, relations: &[&'static Relation]) -> Result<Option<Vec<ColumnRef>>> {
        let mut columns: Vec<ColumnRef> = match &self.projection {
            Projection::All => {
                if relations.is_empty() {
                    return Err(Error::ValidationError(format!(
                        "SELECT * on {} requires a relation include",
                        E::TABLE
                    )));
                }
                return Ok(None);
            }
            Projection::Default => E::default_projection()
                .iter()
                .copied()
                .map(ColumnRef::of)
                .collect(),
            Projection::Columns(cols) => {
                if cols.is_empty() {
                    return Err(Error::ValidationError(
                        "projection must name at least one column".to_string(),
                    ));
                }
                let mut out = Vec::with_capacity(cols.len());
                for c in cols {
                    push_unique(&mut out, ColumnRef::of(*c));
                }
                out
            }
        };
        // Rows are verified against the scope after fetch, and includes are
        // joined on the local column, so both are always returned.
        push_unique(&mut columns, ColumnRef::of(E::TENANT_COLUMN));
        for relation in relations {
            push_unique(&mut columns, relation.local_column);
        }
        Ok(Some(columns))
    }

    pub fn build(&self, scope: &TenantScope) -> Result<Statement> {
        let relations = self.relations()?;
        let plan = SelectPlan {
            table: E::TABLE,
            columns: self.columns(&relations)?,
            filter: scoped_entity_filter::<E>(scope, &self.filter)?,
            order_by: self
                .order_by
                .iter()
                .map(|o| OrderBy {
                    column: ColumnRef::of(o.column),
                    order: o.order,
                })
                .collect(),
            limit: self.limit,
            offset: self.offset,
        };
        Ok(Statement::render(Plan::Select(plan)))
    }

    /// Count of the rows this query matches, ignoring projection, ordering
    /// and paging
    pub fn build_count(&self, scope: &TenantScope) -> Result<Statement> {
        Ok(Statement::render(Plan::Count {
            table: E::TABLE,
            filter: scoped_entity_filter::<E>(scope, &self.filter)?,
        }))
    }
}

/// Fetch the targets of `relation` whose join column is one of `keys`
pub fn select_related(
    scope: &TenantScope,
    relation: &Relation,
    keys: Vec<Value>,
) -> Result<Statement> {
    let mut columns = relation.columns.to_vec();
    push_unique(&mut columns, relation.foreign_column);
    push_unique(&mut columns, relation.tenant_column);
    let filter = scoped(
        scope,
        relation.tenant_column,
        Filter::Field(relation.foreign_column, Condition::In(keys)),
    )?;
    Ok(Statement::render(Plan::Select(SelectPlan {
        table: relation.table,
        columns: Some(columns),
        filter,
        order_by: Vec::new(),
        limit: None,
        offset: None,
    })))
}

/// Grouped aggregate query
#[derive(Debug, Clone)]
pub struct AggregateQuery<E: Entity> {
    filter: Filter<E::Column>,
    group_by: Vec<E::Column>,
    aggregates: Vec<(AggregateFn, Option<E::Column>)>,
}

impl<E: Entity> Default for AggregateQuery<E> {
    fn default() -> Self {
        Self {
            filter: Filter::All,
            group_by: Vec::new(),
            aggregates: Vec::new(),
        }
    }
}

impl<E: Entity> AggregateQuery<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter<E::Column>) -> Self {
        self.filter = std::mem::take(&mut self.filter).and(filter);
        self
    }

    pub fn count(mut self) -> Self {
        self.aggregates.push((AggregateFn::Count, None));
        self
    }

    pub fn sum(mut self, column: E::Column) -> Self {
        self.aggregates.push((AggregateFn::Sum, Some(column)));
        self
    }

    pub fn avg(mut self, column: E::Column) -> Self {
        self.aggregates.push((AggregateFn::Avg, Some(column)));
        self
    }

    pub fn min(mut self, column: E::Column) -> Self {
        self.aggregates.push((AggregateFn::Min, Some(column)));
        self
    }

    pub fn max(mut self, column: E::Column) -> Self {
        self.aggregates.push((AggregateFn::Max, Some(column)));
        self
    }

    pub fn group_by(mut self, column: E::Column) -> Self {
        if !self.group_by.contains(&column) {
            self.group_by.push(column);
        }
        self
    }

    pub fn build(&self, scope: &TenantScope) -> Result<Statement> {
        if self.aggregates.is_empty() {
            return Err(Error::ValidationError(
                "aggregate query needs at least one aggregate".to_string(),
            ));
        }
        let mut aggregates = Vec::with_capacity(self.aggregates.len());
        for (function, column) in &self.aggregates {
            if let Some(c) = column {
                if matches!(function, AggregateFn::Sum | AggregateFn::Avg)
                    && !c.sql_type().is_numeric()
                {
                    return Err(Error::ValidationError(format!(
                        "{} requires a numeric column, got '{}'",
                        function.as_str(),
                        c.name()
                    )));
                }
            }
            aggregates.push(Aggregate {
                function: *function,
                column: column.map(ColumnRef::of),
            });
        }
        Ok(Statement::render(Plan::Aggregate(AggregatePlan {
            table: E::TABLE,
            filter: scoped_entity_filter::<E>(scope, &self.filter)?,
            group_by: self.group_by.iter().copied().map(ColumnRef::of).collect(),
            aggregates,
        })))
    }
}

/// Bulk insert of entity rows
#[derive(Debug, Clone)]
pub struct InsertQuery<E: Entity> {
    rows: Vec<Record>,
    skip_duplicates: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> InsertQuery<E> {
    pub fn new(rows: &[E]) -> Result<Self> {
        let records = rows
            .iter()
            .map(|row| match serde_json::to_value(row) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(Error::Internal(format!(
                    "{} rows must serialize to objects",
                    E::TABLE
                ))),
                Err(e) => Err(Error::Internal(format!("failed to serialize row: {}", e))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_records(records))
    }

    pub fn from_records(rows: Vec<Record>) -> Self {
        Self {
            rows,
            skip_duplicates: false,
            _entity: PhantomData,
        }
    }

    /// Silently skip rows that conflict with existing keys
    pub fn skip_duplicates(mut self, skip: bool) -> Self {
        self.skip_duplicates = skip;
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render one statement per batch, keeping each under the bind
    /// parameter limit.
    ///
    /// Under a tenant scope the tenant column is filled in when absent and a
    /// row naming another tenant fails the whole insert with
    /// [`Error::TenantViolation`]. Cross-tenant inserts must name the tenant
    /// on every row.
    pub fn build_batches(&self, scope: &TenantScope) -> Result<Vec<Statement>> {
        if self.rows.is_empty() {
            return Err(Error::ValidationError("no rows to insert".to_string()));
        }
        let columns: Vec<ColumnRef> = E::columns().iter().copied().map(ColumnRef::of).collect();
        let tenant_column = E::TENANT_COLUMN.name();

        let mut rows = Vec::with_capacity(self.rows.len());
        for (index, record) in self.rows.iter().enumerate() {
            let tenant_value = record.get(tenant_column).unwrap_or(&Value::Null);
            let tenant = match scope {
                TenantScope::Tenant(tenant) => match tenant_value {
                    Value::Null => tenant.as_str().to_string(),
                    Value::String(s) if s.is_empty() => tenant.as_str().to_string(),
                    Value::String(s) if s == tenant.as_str() => s.clone(),
                    other => {
                        return Err(Error::TenantViolation(format!(
                            "row {} of {} belongs to tenant {} but the insert is scoped to {}",
                            index,
                            E::TABLE,
                            other,
                            tenant
                        )))
                    }
                },
                TenantScope::CrossTenant(_) => match tenant_value {
                    Value::String(s) if !s.is_empty() => s.clone(),
                    _ => {
                        return Err(Error::ValidationError(format!(
                            "row {} of {} has no tenant for a cross-tenant insert",
                            index,
                            E::TABLE
                        )))
                    }
                },
            };
            let row: Vec<Value> = columns
                .iter()
                .map(|c| {
                    if c.name == tenant_column {
                        Value::String(tenant.clone())
                    } else {
                        record.get(c.name).cloned().unwrap_or(Value::Null)
                    }
                })
                .collect();
            rows.push(row);
        }

        let per_batch = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
        Ok(rows
            .chunks(per_batch)
            .map(|chunk| {
                Statement::render(Plan::Insert(InsertPlan {
                    table: E::TABLE,
                    columns: columns.clone(),
                    rows: chunk.to_vec(),
                    skip_duplicates: self.skip_duplicates,
                }))
            })
            .collect())
    }
}

/// Bulk update of the rows matching a filter
#[derive(Debug, Clone)]
pub struct UpdateQuery<E: Entity> {
    assignments: Vec<(E::Column, Value)>,
    filter: Filter<E::Column>,
}

impl<E: Entity> Default for UpdateQuery<E> {
    fn default() -> Self {
        Self {
            assignments: Vec::new(),
            filter: Filter::All,
        }
    }
}

impl<E: Entity> UpdateQuery<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: E::Column, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.assignments.iter_mut().find(|entry| entry.0 == column) {
            Some(existing) => existing.1 = value,
            None => self.assignments.push((column, value)),
        }
        self
    }

    pub fn filter(mut self, filter: Filter<E::Column>) -> Self {
        self.filter = std::mem::take(&mut self.filter).and(filter);
        self
    }

    pub fn build(&self, scope: &TenantScope) -> Result<Statement> {
        if self.assignments.is_empty() {
            return Err(Error::ValidationError(
                "update must set at least one column".to_string(),
            ));
        }
        for (column, _) in &self.assignments {
            if *column == E::TENANT_COLUMN || *column == E::PRIMARY_KEY {
                return Err(Error::ValidationError(format!(
                    "column '{}' of {} cannot be updated",
                    column.name(),
                    E::TABLE
                )));
            }
        }
        Ok(Statement::render(Plan::Update(UpdatePlan {
            table: E::TABLE,
            assignments: self
                .assignments
                .iter()
                .map(|(c, v)| (ColumnRef::of(*c), v.clone()))
                .collect(),
            filter: scoped_entity_filter::<E>(scope, &self.filter)?,
        })))
    }
}

/// Bulk delete of the rows matching a filter
#[derive(Debug, Clone)]
pub struct DeleteQuery<E: Entity> {
    filter: Filter<E::Column>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Default for DeleteQuery<E> {
    fn default() -> Self {
        Self {
            filter: Filter::All,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> DeleteQuery<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter<E::Column>) -> Self {
        self.filter = std::mem::take(&mut self.filter).and(filter);
        self
    }

    pub fn build(&self, scope: &TenantScope) -> Result<Statement> {
        if scope.is_elevated() && self.filter == Filter::All {
            return Err(Error::ValidationError(format!(
                "refusing to delete every row of {} across tenants",
                E::TABLE
            )));
        }
        Ok(Statement::render(Plan::Delete {
            table: E::TABLE,
            filter: scoped_entity_filter::<E>(scope, &self.filter)?,
        }))
    }
}
