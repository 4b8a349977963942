//! Query performance tracking and optimization hints
//!
//! The optimizer keeps a bounded history of execution metrics per query id
//! (operation name), flags slow queries, and derives suggestions from the
//! statement text: missing `LIMIT`, `SELECT *`, unfiltered large reads and
//! sorts on columns with no known index.

use crate::classify::ErrorKind;
use crate::pool::ConnectionEvents;
use crate::Error;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

lazy_static! {
    static ref LITERAL: Regex = Regex::new(r"'(?:[^']|'')*'").expect("valid literal regex");
    static ref NUMBER_OR_PARAM: Regex =
        Regex::new(r"(\$\d+)|\b\d+(?:\.\d+)?\b").expect("valid number regex");
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("valid whitespace regex");
    static ref FROM_TABLE: Regex =
        Regex::new(r#"(?i)\bFROM\s+"?([A-Za-z_][A-Za-z0-9_]*)"?"#).expect("valid from regex");
    static ref WHERE_CLAUSE: Regex =
        Regex::new(r"(?i)\bWHERE\b(.*?)(?:\bGROUP\s+BY\b|\bORDER\s+BY\b|\bLIMIT\b|\bOFFSET\b|$)")
            .expect("valid where regex");
    static ref PREDICATE_COLUMN: Regex = Regex::new(
        r#"(?i)"?([A-Za-z_][A-Za-z0-9_]*)"?(?:::[A-Za-z0-9_]+)?\s*(?:=|<>|!=|>=|<=|>|<|\bNOT\s+IN\b|\bIN\b|\bI?LIKE\b|\bIS\b)"#
    )
    .expect("valid predicate regex");
    static ref ORDER_BY: Regex =
        Regex::new(r"(?i)\bORDER\s+BY\s+(.+?)(?:\bLIMIT\b|\bOFFSET\b|$)").expect("valid order regex");
}

const KEYWORDS: &[&str] = &["and", "or", "not", "true", "false", "null", "where"];

/// Optimizer configuration
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Queries slower than this are flagged
    pub slow_query_threshold: Duration,
    /// Metrics kept per query id (oldest evicted first)
    pub max_metrics_per_query: usize,
    /// Row count above which an unfiltered read is reported
    pub large_result_threshold: u64,
    /// Slow queries listed in the optimization report
    pub top_n: usize,
    /// Sanitized statements are truncated to this many characters
    pub max_statement_len: usize,
    /// Error events kept for rate computation
    pub max_error_events: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_millis(1000),
            max_metrics_per_query: 100,
            large_result_threshold: 1000,
            top_n: 10,
            max_statement_len: 500,
            max_error_events: 10_000,
        }
    }
}

impl OptimizerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let slow_query_threshold = match lookup("CONCIERGE_DB_SLOW_QUERY_THRESHOLD_MS")
            .map(|v| v.parse::<u64>())
        {
            Some(Ok(ms)) if ms > 0 => Duration::from_millis(ms),
            Some(_) => {
                warn!(
                    "Invalid slow query threshold, using default={}ms",
                    defaults.slow_query_threshold.as_millis()
                );
                defaults.slow_query_threshold
            }
            None => defaults.slow_query_threshold,
        };
        Self {
            slow_query_threshold,
            ..defaults
        }
    }
}

/// Optimization hint attached to a query metric
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Suggestion {
    /// Multi-row read without a `LIMIT`
    MissingLimit,
    /// `SELECT *`
    UnrestrictedProjection,
    /// Large result set read without a `WHERE`
    MissingFilter { result_count: u64 },
    /// `ORDER BY` on a column with no registered index
    UnindexedSort { table: String, column: String },
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suggestion::MissingLimit => f.write_str("add a LIMIT or paginate the result"),
            Suggestion::UnrestrictedProjection => {
                f.write_str("select only the columns the caller needs")
            }
            Suggestion::MissingFilter { result_count } => write!(
                f,
                "returned {} rows without a WHERE clause; add a filter",
                result_count
            ),
            Suggestion::UnindexedSort { table, column } => {
                write!(f, "ORDER BY {}.{} has no supporting index", table, column)
            }
        }
    }
}

/// One recorded execution
#[derive(Debug, Clone, Serialize)]
pub struct QueryMetric {
    pub query_id: String,
    /// Statement text with literals replaced by `?`
    pub statement: String,
    pub execution_time: Duration,
    pub result_count: u64,
    pub is_slow: bool,
    pub timestamp: DateTime<Utc>,
    pub suggestions: Vec<Suggestion>,
    #[serde(skip)]
    recorded_at: Instant,
}

/// Slow executions of one query id inside a window
#[derive(Debug, Clone, Serialize)]
pub struct SlowQuerySummary {
    pub query_id: String,
    pub statement: String,
    pub occurrences: usize,
    pub avg_time_ms: f64,
    pub max_time_ms: f64,
    pub last_seen: DateTime<Utc>,
    pub suggestions: Vec<Suggestion>,
    /// `CREATE INDEX` statements covering the filter and sort columns
    pub suggested_indexes: Vec<String>,
}

/// Aggregate figures over a window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub total_queries: u64,
    pub slow_queries: u64,
    pub errors: u64,
    pub connection_errors: u64,
    pub avg_time_ms: f64,
    pub p95_time_ms: f64,
    pub total_rows: u64,
}

impl WindowStats {
    /// Failed operations over all operations
    pub fn error_rate(&self) -> f64 {
        let attempts = self.total_queries + self.errors;
        if attempts == 0 {
            0.0
        } else {
            self.errors as f64 / attempts as f64
        }
    }

    pub fn slow_query_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.slow_queries as f64 / self.total_queries as f64
        }
    }
}

/// Output of [`QueryOptimizer::generate_optimization_report`]
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub generated_at: DateTime<Utc>,
    pub window_secs: u64,
    pub stats: WindowStats,
    pub top_slow_queries: Vec<SlowQuerySummary>,
    /// Deduplicated `CREATE INDEX` statements
    pub index_recommendations: Vec<String>,
    /// Human-readable findings
    pub opportunities: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct ErrorEvent {
    at: Instant,
    kind: ErrorKind,
    connection_level: bool,
}

/// Records query executions and derives optimization hints
pub struct QueryOptimizer {
    config: OptimizerConfig,
    metrics: Mutex<HashMap<String, VecDeque<QueryMetric>>>,
    errors: Mutex<VecDeque<ErrorEvent>>,
    indexes: RwLock<HashSet<(String, String)>>,
}

impl QueryOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(HashMap::new()),
            errors: Mutex::new(VecDeque::new()),
            indexes: RwLock::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Declare that `table.column` is indexed, silencing sort suggestions
    pub fn register_index(&self, table: &str, column: &str) {
        self.indexes
            .write()
            .insert((table.to_string(), column.to_string()));
    }

    fn is_indexed(&self, table: &str, column: &str) -> bool {
        self.indexes
            .read()
            .contains(&(table.to_string(), column.to_string()))
    }

    /// Record one execution and return the stored metric
    pub fn track_query(
        &self,
        query_id: &str,
        statement: &str,
        execution_time: Duration,
        result_count: u64,
    ) -> QueryMetric {
        let statement = sanitize_statement(statement, self.config.max_statement_len);
        let is_slow = execution_time > self.config.slow_query_threshold;
        let suggestions = self.suggestions_for(&statement, result_count);
        let metric = QueryMetric {
            query_id: query_id.to_string(),
            statement,
            execution_time,
            result_count,
            is_slow,
            timestamp: Utc::now(),
            suggestions,
            recorded_at: Instant::now(),
        };

        if is_slow {
            warn!(
                query_id = %query_id,
                duration_ms = execution_time.as_millis() as u64,
                threshold_ms = self.config.slow_query_threshold.as_millis() as u64,
                result_count,
                statement = %metric.statement,
                "Slow query detected"
            );
            crate::metrics::SLOW_QUERIES_TOTAL
                .with_label_values(&[query_id])
                .inc();
        }

        let mut metrics = self.metrics.lock();
        let history = metrics.entry(query_id.to_string()).or_default();
        history.push_back(metric.clone());
        while history.len() > self.config.max_metrics_per_query {
            history.pop_front();
        }
        metric
    }

    /// Record a failed operation
    pub fn record_error(&self, query_id: &str, kind: ErrorKind) {
        self.push_error(ErrorEvent {
            at: Instant::now(),
            kind,
            connection_level: false,
        });
        tracing::debug!(query_id = %query_id, kind = %kind, "Recorded query error");
    }

    fn push_error(&self, event: ErrorEvent) {
        let mut errors = self.errors.lock();
        errors.push_back(event);
        while errors.len() > self.config.max_error_events {
            errors.pop_front();
        }
    }

    /// Recorded metrics for `query_id`, oldest first
    pub fn metrics_for(&self, query_id: &str) -> Vec<QueryMetric> {
        self.metrics
            .lock()
            .get(query_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn recent(&self, window: Duration) -> Vec<QueryMetric> {
        let now = Instant::now();
        self.metrics
            .lock()
            .values()
            .flat_map(|h| h.iter())
            .filter(|m| now.saturating_duration_since(m.recorded_at) <= window)
            .cloned()
            .collect()
    }

    /// Slow executions inside `window`, grouped per query id, slowest
    /// average first
    pub fn slow_queries(&self, window: Duration) -> Vec<SlowQuerySummary> {
        let mut grouped: HashMap<String, Vec<QueryMetric>> = HashMap::new();
        for metric in self.recent(window).into_iter().filter(|m| m.is_slow) {
            grouped
                .entry(metric.query_id.clone())
                .or_default()
                .push(metric);
        }

        let mut summaries: Vec<SlowQuerySummary> = grouped
            .into_iter()
            .map(|(query_id, metrics)| {
                let times: Vec<f64> = metrics
                    .iter()
                    .map(|m| m.execution_time.as_secs_f64() * 1000.0)
                    .collect();
                let latest = metrics
                    .iter()
                    .max_by_key(|m| m.recorded_at)
                    .unwrap_or(&metrics[0]);
                let suggestions: BTreeSet<Suggestion> = metrics
                    .iter()
                    .flat_map(|m| m.suggestions.iter().cloned())
                    .collect();
                let suggested_indexes: BTreeSet<String> = metrics
                    .iter()
                    .filter_map(|m| self.index_definition(&m.statement))
                    .collect();
                SlowQuerySummary {
                    statement: latest.statement.clone(),
                    last_seen: latest.timestamp,
                    occurrences: metrics.len(),
                    avg_time_ms: times.iter().sum::<f64>() / times.len() as f64,
                    max_time_ms: times.iter().cloned().fold(0.0, f64::max),
                    suggestions: suggestions.into_iter().collect(),
                    suggested_indexes: suggested_indexes.into_iter().collect(),
                    query_id,
                }
            })
            .collect();

        summaries.sort_by(|a, b| {
            b.avg_time_ms
                .partial_cmp(&a.avg_time_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.query_id.cmp(&b.query_id))
        });
        summaries
    }

    /// Totals, latency and error counts inside `window`
    pub fn window_stats(&self, window: Duration) -> WindowStats {
        let recent = self.recent(window);
        let now = Instant::now();
        let (errors, connection_errors) = {
            let events = self.errors.lock();
            let in_window = events
                .iter()
                .filter(|e| now.saturating_duration_since(e.at) <= window);
            in_window.fold((0u64, 0u64), |(all, conn), e| {
                let is_conn = e.connection_level || e.kind == ErrorKind::Connection;
                (
                    all + u64::from(!e.connection_level),
                    conn + u64::from(is_conn),
                )
            })
        };

        let mut times: Vec<f64> = recent
            .iter()
            .map(|m| m.execution_time.as_secs_f64() * 1000.0)
            .collect();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let avg = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };

        WindowStats {
            total_queries: recent.len() as u64,
            slow_queries: recent.iter().filter(|m| m.is_slow).count() as u64,
            errors,
            connection_errors,
            avg_time_ms: avg,
            p95_time_ms: percentile(&times, 0.95),
            total_rows: recent.iter().map(|m| m.result_count).sum(),
        }
    }

    pub fn generate_optimization_report(&self, window: Duration) -> OptimizationReport {
        let recent = self.recent(window);
        let stats = self.window_stats(window);
        let mut top_slow_queries = self.slow_queries(window);
        top_slow_queries.truncate(self.config.top_n);

        let index_recommendations: BTreeSet<String> = recent
            .iter()
            .filter(|m| m.is_slow)
            .filter_map(|m| self.index_definition(&m.statement))
            .collect();

        let total = recent.len();
        let count = |pred: &dyn Fn(&Suggestion) -> bool| {
            recent
                .iter()
                .filter(|m| m.suggestions.iter().any(pred))
                .count()
        };
        let pct = |n: usize| n as f64 * 100.0 / total.max(1) as f64;

        let mut opportunities = Vec::new();
        let missing_limit = count(&|s| matches!(s, Suggestion::MissingLimit));
        if missing_limit > 0 {
            opportunities.push(format!(
                "{:.1}% of queries have no LIMIT; paginate list endpoints",
                pct(missing_limit)
            ));
        }
        let select_star = count(&|s| matches!(s, Suggestion::UnrestrictedProjection));
        if select_star > 0 {
            opportunities.push(format!(
                "{:.1}% of queries select every column; restrict the projection",
                pct(select_star)
            ));
        }
        let unfiltered = count(&|s| matches!(s, Suggestion::MissingFilter { .. }));
        if unfiltered > 0 {
            opportunities.push(format!(
                "{} queries returned more than {} rows without a filter",
                unfiltered, self.config.large_result_threshold
            ));
        }
        let unindexed = count(&|s| matches!(s, Suggestion::UnindexedSort { .. }));
        if unindexed > 0 {
            opportunities.push(format!(
                "{} queries sort on columns without an index",
                unindexed
            ));
        }
        if stats.slow_queries > 0 {
            opportunities.push(format!(
                "{:.1}% of queries exceeded the {}ms slow-query threshold",
                stats.slow_query_rate() * 100.0,
                self.config.slow_query_threshold.as_millis()
            ));
        }

        let report = OptimizationReport {
            generated_at: Utc::now(),
            window_secs: window.as_secs(),
            stats,
            top_slow_queries,
            index_recommendations: index_recommendations.into_iter().collect(),
            opportunities,
        };
        info!(
            total_queries = report.stats.total_queries,
            slow_queries = report.stats.slow_queries,
            recommendations = report.index_recommendations.len(),
            "Generated query optimization report"
        );
        report
    }

    fn suggestions_for(&self, statement: &str, result_count: u64) -> Vec<Suggestion> {
        let upper = statement.to_uppercase();
        if !upper.trim_start().starts_with("SELECT") {
            return Vec::new();
        }
        let aggregate = upper.contains("COUNT(")
            || upper.contains(" GROUP BY ")
            || upper.contains("SUM(")
            || upper.contains("AVG(");
        let mut out = Vec::new();

        if !aggregate && !upper.contains(" LIMIT ") && result_count > 1 {
            out.push(Suggestion::MissingLimit);
        }
        if upper.contains("SELECT *") {
            out.push(Suggestion::UnrestrictedProjection);
        }
        if !upper.contains(" WHERE ") && result_count > self.config.large_result_threshold {
            out.push(Suggestion::MissingFilter { result_count });
        }
        if let Some(table) = table_of(statement) {
            for column in sort_columns(statement) {
                if !self.is_indexed(&table, &column) {
                    out.push(Suggestion::UnindexedSort {
                        table: table.clone(),
                        column,
                    });
                }
            }
        }
        out
    }

    /// Index covering the filter columns then the sort columns, unless each
    /// of them is already indexed
    fn index_definition(&self, statement: &str) -> Option<String> {
        let table = table_of(statement)?;
        let mut columns: Vec<String> = Vec::new();
        for column in filter_columns(statement)
            .into_iter()
            .chain(sort_columns(statement))
        {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        if columns.is_empty() || columns.iter().all(|c| self.is_indexed(&table, c)) {
            return None;
        }
        Some(format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} ({})",
            table,
            columns.join("_"),
            table,
            columns.join(", ")
        ))
    }
}

impl ConnectionEvents for QueryOptimizer {
    fn connection_error(&self, _error: &Error) {
        self.push_error(ErrorEvent {
            at: Instant::now(),
            kind: ErrorKind::Connection,
            connection_level: true,
        });
    }
}

/// Replace literals with `?`, keep `$n` placeholders, collapse whitespace
/// and truncate
pub fn sanitize_statement(statement: &str, max_len: usize) -> String {
    let no_strings = LITERAL.replace_all(statement, "?");
    let no_numbers = NUMBER_OR_PARAM.replace_all(&no_strings, |caps: &regex::Captures| {
        caps.get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "?".to_string())
    });
    let collapsed = WHITESPACE.replace_all(no_numbers.trim(), " ");
    if collapsed.chars().count() > max_len {
        collapsed.chars().take(max_len).collect()
    } else {
        collapsed.into_owned()
    }
}

fn table_of(statement: &str) -> Option<String> {
    FROM_TABLE
        .captures(statement)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
}

fn filter_columns(statement: &str) -> Vec<String> {
    let Some(clause) = WHERE_CLAUSE.captures(statement).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for caps in PREDICATE_COLUMN.captures_iter(clause.as_str()) {
        let column = caps[1].to_lowercase();
        if !KEYWORDS.contains(&column.as_str()) && !out.contains(&column) {
            out.push(column);
        }
    }
    out
}

fn sort_columns(statement: &str) -> Vec<String> {
    let Some(clause) = ORDER_BY.captures(statement).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    clause
        .as_str()
        .split(',')
        .filter_map(|part| part.split_whitespace().next())
        .map(|c| c.trim_matches('"').to_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
