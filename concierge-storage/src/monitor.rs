//! Rolling health snapshots and alerting
//!
//! [`DatabaseMonitor`] samples the pool, optimizer and circuit breakers on a
//! fixed interval, keeps the last `history_size` snapshots, and evaluates
//! [`AlertRule`]s against each one. Raised and resolved alerts are published
//! on a broadcast channel.

use crate::handler::ErrorHandler;
use crate::optimizer::QueryOptimizer;
use crate::pool::{ConnectionPool, PoolStatus};
use crate::query::Statement;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STORAGE_PROBE_SQL: &str = "SELECT pg_database_size(current_database()) AS database_size_bytes, \
     (SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public') AS table_count";

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling interval
    pub interval: Duration,
    /// Snapshots kept in the ring buffer
    pub history_size: usize,
    /// Resolved alerts kept
    pub alert_history_size: usize,
    /// Window used for query statistics
    pub window: Duration,
    /// Query database size and table count each tick
    pub storage_probe: bool,
    pub probe_timeout: Duration,
    pub rules: Vec<AlertRule>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            history_size: 120,
            alert_history_size: 500,
            window: Duration::from_secs(300),
            storage_probe: true,
            probe_timeout: Duration::from_secs(5),
            rules: AlertRule::defaults(),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let interval = match lookup("CONCIERGE_DB_MONITOR_INTERVAL_MS").map(|v| v.parse::<u64>()) {
            Some(Ok(ms)) if ms > 0 => Duration::from_millis(ms),
            Some(_) => {
                warn!(
                    "Invalid monitor interval, using default={}ms",
                    defaults.interval.as_millis()
                );
                defaults.interval
            }
            None => defaults.interval,
        };
        let storage_probe = match lookup("CONCIERGE_DB_MONITOR_STORAGE_PROBE").as_deref() {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => {
                warn!(value = %other, "Invalid storage probe flag, using default=true");
                true
            }
            None => defaults.storage_probe,
        };
        Self {
            interval,
            storage_probe,
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub avg_query_time_ms: f64,
    pub p95_query_time_ms: f64,
    pub queries_per_second: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub total_queries: u64,
    pub slow_queries: u64,
    pub errors: u64,
    pub connection_errors: u64,
    pub slow_query_rate: f64,
    pub rows_returned: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub database_size_bytes: i64,
    pub table_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub open_circuits: Vec<String>,
    pub issues: Vec<String>,
}

/// One sample of the data layer's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub performance: PerformanceMetrics,
    pub query: QueryStats,
    pub connection: PoolStatus,
    /// Absent when the backend cannot answer the probe
    pub storage: Option<StorageMetrics>,
    pub health: HealthSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    /// Failed operations over all operations in the window
    ErrorRate,
    /// Slow queries over all queries in the window
    SlowQueryRate,
    /// Number of breakers not in the closed state at sampling time.
    /// This is a level, not a count of how often circuits opened.
    OpenCircuits,
    /// Checked-out connections over max connections
    PoolUtilization,
    /// Callers queued for a connection
    WaitingAcquirers,
    /// Mean query latency in milliseconds
    AverageQueryTime,
}

impl AlertCondition {
    pub fn observe(&self, snapshot: &MonitorSnapshot) -> f64 {
        match self {
            AlertCondition::ErrorRate => snapshot.performance.error_rate,
            AlertCondition::SlowQueryRate => snapshot.query.slow_query_rate,
            AlertCondition::OpenCircuits => snapshot.health.open_circuits.len() as f64,
            AlertCondition::PoolUtilization => snapshot.connection.utilization(),
            AlertCondition::WaitingAcquirers => snapshot.connection.waiting as f64,
            AlertCondition::AverageQueryTime => snapshot.performance.avg_query_time_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// A rule holds while the observed value exceeds `threshold`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub severity: AlertSeverity,
    /// Minimum time between two alerts from this rule
    pub cooldown: Duration,
    pub enabled: bool,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: AlertCondition,
        threshold: f64,
        severity: AlertSeverity,
        cooldown: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition,
            threshold,
            severity,
            cooldown,
            enabled: true,
        }
    }

    pub fn holds(&self, snapshot: &MonitorSnapshot) -> Option<f64> {
        let observed = self.condition.observe(snapshot);
        (observed > self.threshold).then_some(observed)
    }

    pub fn defaults() -> Vec<AlertRule> {
        use AlertCondition::*;
        use AlertSeverity::*;
        vec![
            AlertRule::new("high_error_rate", "High error rate", ErrorRate, 0.05, Critical, Duration::from_secs(300)),
            AlertRule::new("slow_query_rate", "Slow query rate", SlowQueryRate, 0.1, Warning, Duration::from_secs(300)),
            AlertRule::new("open_circuits", "Circuit breaker open", OpenCircuits, 0.0, Critical, Duration::from_secs(60)),
            AlertRule::new("pool_utilization", "Connection pool saturated", PoolUtilization, 0.9, Warning, Duration::from_secs(300)),
            AlertRule::new("waiting_acquirers", "Callers queued for connections", WaitingAcquirers, 5.0, Warning, Duration::from_secs(120)),
            AlertRule::new("avg_query_time", "Average query latency", AverageQueryTime, 500.0, Warning, Duration::from_secs(300)),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub observed_value: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub auto_resolved: bool,
}

/// Published on [`DatabaseMonitor::subscribe`]
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    AlertRaised(Alert),
    AlertResolved(Alert),
}

struct MonitorState {
    snapshots: VecDeque<MonitorSnapshot>,
    rules: Vec<AlertRule>,
    active: Vec<Alert>,
    history: VecDeque<Alert>,
    last_fired: HashMap<String, Instant>,
}

/// Periodic sampler and alert evaluator
pub struct DatabaseMonitor {
    pool: ConnectionPool,
    optimizer: Arc<QueryOptimizer>,
    handler: Arc<ErrorHandler>,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<MonitorEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DatabaseMonitor {
    pub fn new(
        pool: ConnectionPool,
        optimizer: Arc<QueryOptimizer>,
        handler: Arc<ErrorHandler>,
        config: MonitorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let state = MonitorState {
            snapshots: VecDeque::with_capacity(config.history_size),
            rules: config.rules.clone(),
            active: Vec::new(),
            history: VecDeque::new(),
            last_fired: HashMap::new(),
        };
        Self {
            pool,
            optimizer,
            handler,
            config,
            state: Mutex::new(state),
            events,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Receive alert events raised from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Spawn the sampling loop. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.interval;
        info!(interval_ms = interval.as_millis() as u64, "Starting database monitor");
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                let snapshot = monitor.tick().await;
                debug!(status = ?snapshot.health.status, "Collected monitor snapshot");
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Stopped database monitor");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Collect one snapshot, store it and evaluate the alert rules
    pub async fn tick(&self) -> MonitorSnapshot {
        let snapshot = self.collect().await;

        let events = {
            let mut state = self.state.lock();
            state.snapshots.push_back(snapshot.clone());
            while state.snapshots.len() > self.config.history_size {
                state.snapshots.pop_front();
            }
            self.evaluate(&mut state, &snapshot)
        };

        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        snapshot
    }

    async fn collect(&self) -> MonitorSnapshot {
        let window = self.config.window;
        let stats = self.optimizer.window_stats(window);
        let connection = self.pool.status();
        let open_circuits = self.handler.breakers().open_circuits();
        let storage = if self.config.storage_probe {
            self.probe_storage().await
        } else {
            None
        };

        let performance = PerformanceMetrics {
            avg_query_time_ms: stats.avg_time_ms,
            p95_query_time_ms: stats.p95_time_ms,
            queries_per_second: stats.total_queries as f64 / window.as_secs_f64().max(1.0),
            error_rate: stats.error_rate(),
        };
        let query = QueryStats {
            total_queries: stats.total_queries,
            slow_queries: stats.slow_queries,
            errors: stats.errors,
            connection_errors: stats.connection_errors,
            slow_query_rate: stats.slow_query_rate(),
            rows_returned: stats.total_rows,
        };
        let health = assess_health(&performance, &connection, open_circuits);

        MonitorSnapshot {
            timestamp: Utc::now(),
            performance,
            query,
            connection,
            storage,
            health,
        }
    }

    async fn probe_storage(&self) -> Option<StorageMetrics> {
        let probe = async {
            let mut conn = self.pool.acquire().await?;
            let rows = conn
                .fetch(&Statement::raw(STORAGE_PROBE_SQL, Vec::new()))
                .await?;
            let row = rows
                .first()
                .ok_or_else(|| Error::Internal("storage probe returned no rows".into()))?;
            let field = |name: &str| row.get(name).and_then(|v| v.as_i64());
            match (field("database_size_bytes"), field("table_count")) {
                (Some(database_size_bytes), Some(table_count)) => Ok(StorageMetrics {
                    database_size_bytes,
                    table_count,
                }),
                _ => Err(Error::Internal("storage probe returned unexpected columns".into())),
            }
        };

        let result: Result<StorageMetrics> =
            match tokio::time::timeout(self.config.probe_timeout, probe).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout("storage probe".into())),
            };
        match result {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                debug!(error = %e, "Storage probe unavailable");
                None
            }
        }
    }

    fn evaluate(&self, state: &mut MonitorState, snapshot: &MonitorSnapshot) -> Vec<MonitorEvent> {
        let now = Instant::now();
        let mut events = Vec::new();
        let rules: Vec<AlertRule> = state.rules.iter().filter(|r| r.enabled).cloned().collect();

        for rule in &rules {
            let observed = rule.holds(snapshot);
            let active_idx = state.active.iter().position(|a| a.rule_id == rule.id);

            match (observed, active_idx) {
                (Some(value), None) => {
                    let cooled = state
                        .last_fired
                        .get(&rule.id)
                        .map_or(true, |at| now.saturating_duration_since(*at) >= rule.cooldown);
                    if !cooled {
                        continue;
                    }
                    let alert = Alert {
                        id: Uuid::new_v4(),
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        severity: rule.severity,
                        status: AlertStatus::Active,
                        message: format!(
                            "{}: observed {:.3} exceeds threshold {:.3}",
                            rule.name, value, rule.threshold
                        ),
                        observed_value: value,
                        threshold: rule.threshold,
                        created_at: Utc::now(),
                        acknowledged_at: None,
                        acknowledged_by: None,
                        resolved_at: None,
                        auto_resolved: false,
                    };
                    match rule.severity {
                        AlertSeverity::Critical => error!(
                            rule = %rule.id,
                            observed = value,
                            threshold = rule.threshold,
                            "Database alert raised"
                        ),
                        _ => warn!(
                            rule = %rule.id,
                            observed = value,
                            threshold = rule.threshold,
                            "Database alert raised"
                        ),
                    }
                    crate::metrics::ALERTS_RAISED_TOTAL
                        .with_label_values(&[rule.id.as_str(), rule.severity.as_str()])
                        .inc();
                    state.last_fired.insert(rule.id.clone(), now);
                    state.active.push(alert.clone());
                    events.push(MonitorEvent::AlertRaised(alert));
                }
                (Some(value), Some(idx)) => {
                    state.active[idx].observed_value = value;
                }
                (None, Some(idx)) => {
                    let mut alert = state.active.remove(idx);
                    alert.status = AlertStatus::Resolved;
                    alert.resolved_at = Some(Utc::now());
                    alert.auto_resolved = true;
                    info!(rule = %alert.rule_id, alert_id = %alert.id, "Database alert auto-resolved");
                    push_history(&mut state.history, alert.clone(), self.config.alert_history_size);
                    events.push(MonitorEvent::AlertResolved(alert));
                }
                (None, None) => {}
            }
        }
        events
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.state.lock().active.clone()
    }

    /// Resolved alerts, oldest first
    pub fn alert_history(&self) -> Vec<Alert> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn acknowledge_alert(&self, id: Uuid, by: impl Into<String>) -> Result<Alert> {
        let mut state = self.state.lock();
        let alert = state
            .active
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(format!("active alert {}", id)))?;
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(Utc::now());
        alert.acknowledged_by = Some(by.into());
        info!(alert_id = %id, rule = %alert.rule_id, "Database alert acknowledged");
        Ok(alert.clone())
    }

    /// Resolve an active alert by hand and move it to history
    pub fn resolve_alert(&self, id: Uuid) -> Result<Alert> {
        let alert = {
            let mut state = self.state.lock();
            let idx = state
                .active
                .iter()
                .position(|a| a.id == id)
                .ok_or_else(|| Error::NotFound(format!("active alert {}", id)))?;
            let mut alert = state.active.remove(idx);
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(Utc::now());
            push_history(&mut state.history, alert.clone(), self.config.alert_history_size);
            alert
        };
        info!(alert_id = %id, rule = %alert.rule_id, "Database alert resolved");
        let _ = self.events.send(MonitorEvent::AlertResolved(alert.clone()));
        Ok(alert)
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.state.lock().rules.clone()
    }

    /// Add a rule, replacing any rule with the same id
    pub fn add_rule(&self, rule: AlertRule) {
        let mut state = self.state.lock();
        state.rules.retain(|r| r.id != rule.id);
        state.rules.push(rule);
    }

    /// Remove a rule and resolve any alert it still has active
    pub fn remove_rule(&self, id: &str) -> bool {
        let (removed, retired) = {
            let mut state = self.state.lock();
            let before = state.rules.len();
            state.rules.retain(|r| r.id != id);
            let removed = state.rules.len() != before;
            let retired = if removed {
                self.retire_alerts(&mut state, id)
            } else {
                Vec::new()
            };
            (removed, retired)
        };
        self.announce_resolved(retired);
        removed
    }

    /// Disabling a rule resolves any alert it still has active
    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let retired = {
            let mut state = self.state.lock();
            let rule = state
                .rules
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::NotFound(format!("alert rule {}", id)))?;
            rule.enabled = enabled;
            if enabled {
                Vec::new()
            } else {
                self.retire_alerts(&mut state, id)
            }
        };
        self.announce_resolved(retired);
        Ok(())
    }

    fn retire_alerts(&self, state: &mut MonitorState, rule_id: &str) -> Vec<Alert> {
        let (retired, kept): (Vec<Alert>, Vec<Alert>) = std::mem::take(&mut state.active)
            .into_iter()
            .partition(|a| a.rule_id == rule_id);
        state.active = kept;

        let now = Utc::now();
        retired
            .into_iter()
            .map(|mut alert| {
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(now);
                alert.auto_resolved = true;
                push_history(&mut state.history, alert.clone(), self.config.alert_history_size);
                alert
            })
            .collect()
    }

    fn announce_resolved(&self, alerts: Vec<Alert>) {
        for alert in alerts {
            info!(rule = %alert.rule_id, alert_id = %alert.id, "Database alert resolved with its rule");
            let _ = self.events.send(MonitorEvent::AlertResolved(alert));
        }
    }

    pub fn latest_snapshot(&self) -> Option<MonitorSnapshot> {
        self.state.lock().snapshots.back().cloned()
    }

    /// Stored snapshots, oldest first
    pub fn snapshots(&self) -> Vec<MonitorSnapshot> {
        self.state.lock().snapshots.iter().cloned().collect()
    }
}

impl Drop for DatabaseMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

fn push_history(history: &mut VecDeque<Alert>, alert: Alert, max: usize) {
    history.push_back(alert);
    while history.len() > max {
        history.pop_front();
    }
}

fn assess_health(
    performance: &PerformanceMetrics,
    connection: &PoolStatus,
    open_circuits: Vec<String>,
) -> HealthSummary {
    let mut issues = Vec::new();
    let mut unhealthy = false;

    if connection.closed {
        issues.push("connection pool is closed".to_string());
        unhealthy = true;
    }
    if !open_circuits.is_empty() {
        issues.push(format!("circuit open for {}", open_circuits.join(", ")));
    }
    if performance.error_rate > 0.5 {
        issues.push(format!("error rate {:.1}%", performance.error_rate * 100.0));
        unhealthy = true;
    } else if performance.error_rate > 0.05 {
        issues.push(format!("error rate {:.1}%", performance.error_rate * 100.0));
    }
    if connection.utilization() >= 0.9 {
        issues.push(format!(
            "pool utilization {:.0}%",
            connection.utilization() * 100.0
        ));
    }
    if connection.waiting > 0 {
        issues.push(format!("{} callers waiting for a connection", connection.waiting));
    }

    let status = if unhealthy {
        HealthStatus::Unhealthy
    } else if issues.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    HealthSummary {
        status,
        open_circuits,
        issues,
    }
}
