//! Custom assertions for common verification patterns
//!
//! Provides assertion helpers that give better error messages than a bare
//! `assert!` on records and errors.

use concierge_storage::query::compare_values;
use concierge_storage::{Error, ErrorKind, Page, Record, SortOrder};
use serde_json::Value;
use std::cmp::Ordering;

/// Assert every row belongs to `tenant_id`
pub fn assert_tenant_scoped(rows: &[Record], tenant_id: &str) {
    for (i, row) in rows.iter().enumerate() {
        let owner = row.get("tenant_id").and_then(Value::as_str);
        assert_eq!(
            owner,
            Some(tenant_id),
            "Row {} belongs to tenant {:?}, expected '{}'",
            i,
            owner,
            tenant_id
        );
    }
}

/// Assert rows contain exactly the given columns (order-insensitive)
pub fn assert_columns(rows: &[Record], expected: &[&str]) {
    for (i, row) in rows.iter().enumerate() {
        let mut actual: Vec<&str> = row.keys().map(String::as_str).collect();
        actual.sort_unstable();
        let mut wanted = expected.to_vec();
        wanted.sort_unstable();
        assert_eq!(actual, wanted, "Row {} has unexpected columns", i);
    }
}

/// Assert no row exposes `column`
pub fn assert_column_absent(rows: &[Record], column: &str) {
    for (i, row) in rows.iter().enumerate() {
        assert!(
            !row.contains_key(column),
            "Row {} unexpectedly contains column '{}'",
            i,
            column
        );
    }
}

/// Assert rows are sorted by `column`, with NULLs last ascending and first
/// descending
pub fn assert_sorted_by(rows: &[Record], column: &str, order: SortOrder) {
    for pair in rows.windows(2) {
        let a = pair[0].get(column).unwrap_or(&Value::Null);
        let b = pair[1].get(column).unwrap_or(&Value::Null);
        let ordering = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => compare_values(a, b).unwrap_or(Ordering::Equal),
        };
        let ok = match order {
            SortOrder::Asc => ordering != Ordering::Greater,
            SortOrder::Desc => ordering != Ordering::Less,
        };
        assert!(
            ok,
            "Rows not sorted {:?} by '{}': {} before {}",
            order, column, a, b
        );
    }
}

/// Assert the error (or the error it wraps) classifies as `kind`
pub fn assert_error_kind(err: &Error, kind: ErrorKind) {
    assert_eq!(
        err.kind(),
        kind,
        "Expected {:?} error but got {:?}: {}",
        kind,
        err.kind(),
        err
    );
}

pub fn assert_tenant_violation(err: &Error) {
    assert!(
        matches!(err.root(), Error::TenantViolation(_)),
        "Expected TenantViolation but got: {}",
        err
    );
}

pub fn assert_validation_error(err: &Error) {
    assert!(
        matches!(err.root(), Error::ValidationError(_)),
        "Expected ValidationError but got: {}",
        err
    );
}

/// Pagination assertion helpers
pub struct PageAssertions<'a, T> {
    page: &'a Page<T>,
}

impl<'a, T> PageAssertions<'a, T> {
    pub fn new(page: &'a Page<T>) -> Self {
        Self { page }
    }

    pub fn assert_len(self, expected: usize) -> Self {
        assert_eq!(
            self.page.data.len(),
            expected,
            "Expected {} rows on page {} but got {}",
            expected,
            self.page.pagination.page,
            self.page.data.len()
        );
        self
    }

    pub fn assert_total(self, total: u64, total_pages: u64) -> Self {
        assert_eq!(self.page.pagination.total, total, "Unexpected total");
        assert_eq!(
            self.page.pagination.total_pages, total_pages,
            "Unexpected total_pages"
        );
        self
    }

    pub fn assert_navigation(self, has_prev: bool, has_next: bool) -> Self {
        assert_eq!(self.page.pagination.has_prev, has_prev, "Unexpected has_prev");
        assert_eq!(self.page.pagination.has_next, has_next, "Unexpected has_next");
        self
    }
}
