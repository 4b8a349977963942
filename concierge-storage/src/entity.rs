//! Entity and column metadata used by the query builder
//!
//! Each table is described by an [`Entity`] with a typed column enum. Filters,
//! projections and sort keys are expressed in terms of that enum, so a
//! statement can only reference columns the entity declares.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

/// PostgreSQL type of a column, used to cast bound parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Text,
    Uuid,
    Integer,
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Json,
}

impl SqlType {
    /// Cast suffix appended to parameter placeholders
    pub fn cast(self) -> &'static str {
        match self {
            SqlType::Text => "::text",
            SqlType::Uuid => "::uuid",
            SqlType::Integer => "::int4",
            SqlType::BigInt => "::int8",
            SqlType::Double => "::float8",
            SqlType::Boolean => "::bool",
            SqlType::Timestamp => "::timestamptz",
            SqlType::Json => "::jsonb",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            SqlType::Integer | SqlType::BigInt | SqlType::Double
        )
    }
}

/// A column of an entity
pub trait Column: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Column name as stored in the database
    fn name(self) -> &'static str;

    fn sql_type(self) -> SqlType {
        SqlType::Text
    }
}

/// Untyped column reference, used once a statement has been lowered from an
/// entity's column enum, and for relation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub name: &'static str,
    pub sql_type: SqlType,
}

impl ColumnRef {
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self { name, sql_type }
    }

    pub fn of<C: Column>(column: C) -> Self {
        Self {
            name: column.name(),
            sql_type: column.sql_type(),
        }
    }
}

impl Column for ColumnRef {
    fn name(self) -> &'static str {
        self.name
    }

    fn sql_type(self) -> SqlType {
        self.sql_type
    }
}

/// Cardinality of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// This row references one row of the target (nested as an object)
    BelongsTo,
    /// Rows of the target reference this row (nested as an array)
    HasMany,
}

/// A relation that can be requested with `include`
#[derive(Debug, Clone, Copy)]
pub struct Relation {
    /// Name used in `include` and as the nested key in results
    pub name: &'static str,
    pub kind: RelationKind,
    /// Column on this entity holding the join key
    pub local_column: ColumnRef,
    /// Target table
    pub table: &'static str,
    /// Column on the target table matched against `local_column`
    pub foreign_column: ColumnRef,
    /// Tenant column on the target table
    pub tenant_column: ColumnRef,
    /// Columns of the target returned in the nested records
    pub columns: &'static [ColumnRef],
}

/// A tenant-owned table
pub trait Entity: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Column: Column;

    const TABLE: &'static str;

    /// Column holding the owning tenant
    const TENANT_COLUMN: Self::Column;

    const PRIMARY_KEY: Self::Column;

    /// Every column, in insert order
    fn columns() -> &'static [Self::Column];

    /// Columns returned when the caller does not choose a projection
    fn default_projection() -> &'static [Self::Column];

    fn relations() -> &'static [Relation] {
        &[]
    }

    fn relation(name: &str) -> Option<&'static Relation> {
        Self::relations().iter().find(|r| r.name == name)
    }

    fn column_by_name(name: &str) -> Option<Self::Column> {
        Self::columns().iter().copied().find(|c| c.name() == name)
    }
}
