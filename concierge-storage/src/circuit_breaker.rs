//! Per-operation circuit breakers
//!
//! Each breaker key (an operation name such as `guests.find_many`) gets its
//! own breaker, created lazily on first use and kept for the life of the
//! process. Every decision is computed by the pure [`BreakerState::admit`] and
//! [`BreakerState::next_state`]; [`CircuitBreakerRegistry`] applies them under
//! the map's shard lock and emits logs and metrics afterwards.
//!
//! ## Configuration
//!
//! - `CONCIERGE_DB_CIRCUIT_FAILURE_THRESHOLD`: consecutive failures to open a circuit (default: 5)
//! - `CONCIERGE_DB_CIRCUIT_RESET_TIMEOUT_MS`: time an open circuit rejects calls (default: 30000)
//!
//! ## Metrics
//!
//! - `concierge_db_circuit_breaker_state{key}`: Gauge (0=closed, 1=open, 2=half_open)
//! - `concierge_db_circuit_breaker_opens_total{key}`: Counter
//! - `concierge_db_circuit_breaker_half_open_attempts_total{key,result}`: Counter
//!
//! ## States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Fail-fast mode, calls rejected until the reset timeout elapses
//! - **Half-Open**: A single trial call is in flight; its outcome closes or
//!   re-opens the circuit

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Circuit breaker configuration, shared by every key
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time an open circuit rejects calls before admitting a trial
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5, // 5 consecutive failures
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Load configuration from environment variables with validation
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let failure_threshold = lookup("CONCIERGE_DB_CIRCUIT_FAILURE_THRESHOLD")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(5);

        let reset_timeout_ms = lookup("CONCIERGE_DB_CIRCUIT_RESET_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30_000);

        // Validate configuration
        let failure_threshold = if failure_threshold == 0 {
            warn!("Invalid failure_threshold=0, using default=5");
            5
        } else {
            failure_threshold
        };

        let reset_timeout_ms = if reset_timeout_ms == 0 {
            warn!("Invalid reset_timeout=0, using default=30000ms");
            30_000
        } else {
            reset_timeout_ms
        };

        info!(
            failure_threshold = %failure_threshold,
            reset_timeout_ms = %reset_timeout_ms,
            "Circuit breaker configuration validated and loaded"
        );

        Self {
            failure_threshold,
            reset_timeout: Duration::from_millis(reset_timeout_ms),
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of asking a breaker to admit a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call proceeds normally
    Allow,
    /// Reset timeout elapsed; this call is the single half-open trial
    Trial,
    /// Call rejected without being attempted
    Reject { retry_after: Duration },
}

/// Input to the breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    TrialStarted,
    Success,
    Failure,
    /// The trial call was cancelled before reporting an outcome
    TrialAbandoned,
}

/// State of one breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<Instant>,
    pub next_retry_time: Option<Instant>,
    /// Guard to prevent multiple concurrent half-open trials
    pub trial_in_flight: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_retry_time: None,
            trial_in_flight: false,
        }
    }
}

impl BreakerState {
    /// Decide whether a call may proceed at `now`
    pub fn admit(&self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allow,
            CircuitState::Open => match self.next_retry_time {
                Some(at) if now < at => Admission::Reject {
                    retry_after: at - now,
                },
                _ if self.trial_in_flight => Admission::Reject {
                    retry_after: Duration::ZERO,
                },
                _ => Admission::Trial,
            },
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Admission::Reject {
                        retry_after: Duration::ZERO,
                    }
                } else {
                    Admission::Trial
                }
            }
        }
    }

    /// Apply `event` at `now`, returning the next state
    pub fn next_state(
        &self,
        event: BreakerEvent,
        now: Instant,
        config: &CircuitBreakerConfig,
    ) -> BreakerState {
        let mut next = self.clone();
        match event {
            BreakerEvent::TrialStarted => {
                next.state = CircuitState::HalfOpen;
                next.trial_in_flight = true;
            }
            BreakerEvent::Success => {
                next.success_count = next.success_count.saturating_add(1);
                next.failure_count = 0;
                if self.state == CircuitState::HalfOpen {
                    next.state = CircuitState::Closed;
                    next.next_retry_time = None;
                    next.trial_in_flight = false;
                }
            }
            BreakerEvent::Failure => {
                next.failure_count = next.failure_count.saturating_add(1);
                next.last_failure_time = Some(now);
                let opens = match self.state {
                    CircuitState::HalfOpen => true,
                    CircuitState::Closed => next.failure_count >= config.failure_threshold,
                    CircuitState::Open => false,
                };
                if opens {
                    next.state = CircuitState::Open;
                    next.success_count = 0;
                    next.next_retry_time = Some(now + config.reset_timeout);
                    next.trial_in_flight = false;
                }
            }
            BreakerEvent::TrialAbandoned => {
                if self.state == CircuitState::HalfOpen {
                    next.state = CircuitState::Open;
                }
                next.trial_in_flight = false;
            }
        }
        next
    }
}

/// Serializable view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Time until an open circuit admits a trial
    pub retry_in_ms: Option<u64>,
}

impl CircuitBreakerSnapshot {
    fn from_state(key: &str, state: &BreakerState, now: Instant) -> Self {
        let wall_now = Utc::now();
        Self {
            key: key.to_string(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_at: state.last_failure_time.and_then(|t| {
                chrono::Duration::from_std(now.saturating_duration_since(t))
                    .ok()
                    .map(|ago| wall_now - ago)
            }),
            retry_in_ms: match state.state {
                CircuitState::Open => state
                    .next_retry_time
                    .map(|t| t.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
        }
    }
}

/// Lazily-populated map of breakers keyed by operation name
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, BreakerState>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "Initialized circuit breaker registry"
        );
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Apply an event to `key`'s breaker, returning (before, after)
    fn transition(&self, key: &str, event: BreakerEvent) -> (BreakerState, BreakerState) {
        let now = Instant::now();
        let mut entry = self.breakers.entry(key.to_string()).or_default();
        let before = entry.clone();
        let after = before.next_state(event, now, &self.config);
        *entry = after.clone();
        (before, after)
    }

    /// Ask `key`'s breaker to admit a call.
    ///
    /// Returns [`Error::CircuitOpen`] when the call must not be attempted.
    /// Admitting the half-open trial and marking it in flight happen under
    /// the same lock, so concurrent callers see exactly one trial.
    pub fn try_acquire(&self, key: &str) -> Result<BreakerPermit<'_>> {
        let now = Instant::now();
        let admission = {
            let mut entry = self.breakers.entry(key.to_string()).or_default();
            let admission = entry.admit(now);
            if admission == Admission::Trial {
                *entry = entry.next_state(BreakerEvent::TrialStarted, now, &self.config);
            }
            admission
        };

        match admission {
            Admission::Allow => Ok(BreakerPermit::new(self, key, false)),
            Admission::Trial => {
                info!(key = %key, "Attempting half-open trial after reset timeout");
                crate::metrics::CIRCUIT_BREAKER_STATE
                    .with_label_values(&[key])
                    .set(CircuitState::HalfOpen.gauge_value());
                Ok(BreakerPermit::new(self, key, true))
            }
            Admission::Reject { retry_after } => {
                warn!(
                    key = %key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit breaker is open, rejecting operation"
                );
                Err(Error::CircuitOpen {
                    key: key.to_string(),
                    retry_after,
                })
            }
        }
    }

    fn record_success(&self, key: &str, trial: bool) {
        let (before, after) = self.transition(key, BreakerEvent::Success);
        if trial {
            crate::metrics::CIRCUIT_BREAKER_HALF_OPEN_ATTEMPTS
                .with_label_values(&[key, "success"])
                .inc();
        }
        if before.state != after.state {
            info!(key = %key, "Half-open trial succeeded, circuit closed");
            crate::metrics::CIRCUIT_BREAKER_STATE
                .with_label_values(&[key])
                .set(after.state.gauge_value());
        }
    }

    fn record_failure(&self, key: &str, trial: bool, err: &Error) {
        let (before, after) = self.transition(key, BreakerEvent::Failure);
        if trial {
            crate::metrics::CIRCUIT_BREAKER_HALF_OPEN_ATTEMPTS
                .with_label_values(&[key, "failure"])
                .inc();
        }

        if after.state == CircuitState::Open && before.state != CircuitState::Open {
            error!(
                key = %key,
                from = %before.state,
                failure_count = after.failure_count,
                threshold = self.config.failure_threshold,
                error = %err,
                "Circuit breaker transition: {} → open",
                before.state
            );
            crate::metrics::CIRCUIT_BREAKER_OPENS_TOTAL
                .with_label_values(&[key])
                .inc();
            crate::metrics::CIRCUIT_BREAKER_STATE
                .with_label_values(&[key])
                .set(CircuitState::Open.gauge_value());
        } else if after.state == CircuitState::Closed {
            warn!(
                key = %key,
                failure_count = after.failure_count,
                threshold = self.config.failure_threshold,
                error = %err,
                "Operation failed, circuit breaker remains closed"
            );
        }
    }

    fn abort_trial(&self, key: &str) {
        let (_, after) = self.transition(key, BreakerEvent::TrialAbandoned);
        warn!(key = %key, "Half-open trial abandoned before completing");
        crate::metrics::CIRCUIT_BREAKER_HALF_OPEN_ATTEMPTS
            .with_label_values(&[key, "abandoned"])
            .inc();
        crate::metrics::CIRCUIT_BREAKER_STATE
            .with_label_values(&[key])
            .set(after.state.gauge_value());
    }

    /// Snapshot of `key`'s breaker, if it has been used
    pub fn state(&self, key: &str) -> Option<CircuitBreakerSnapshot> {
        let now = Instant::now();
        self.breakers
            .get(key)
            .map(|entry| CircuitBreakerSnapshot::from_state(key, &entry, now))
    }

    /// Snapshots of every breaker
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| CircuitBreakerSnapshot::from_state(entry.key(), entry.value(), now))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Keys whose circuit is not closed
    pub fn open_circuits(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .breakers
            .iter()
            .filter(|e| e.value().state != CircuitState::Closed)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Force `key`'s breaker closed. Returns false if the key is unknown.
    pub fn reset(&self, key: &str) -> bool {
        match self.breakers.get_mut(key) {
            Some(mut entry) => {
                *entry = BreakerState::default();
                info!(key = %key, "Circuit breaker manually reset");
                crate::metrics::CIRCUIT_BREAKER_STATE
                    .with_label_values(&[key])
                    .set(CircuitState::Closed.gauge_value());
                true
            }
            None => false,
        }
    }
}

/// Admission to call through a breaker. Report the outcome with
/// [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure); dropping an unreported trial
/// permit re-opens the circuit so the next caller can try again.
pub struct BreakerPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    key: String,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(registry: &'a CircuitBreakerRegistry, key: &str, trial: bool) -> Self {
        Self {
            registry,
            key: key.to_string(),
            trial,
            settled: false,
        }
    }

    /// True when this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.registry.record_success(&self.key, self.trial);
    }

    pub fn record_failure(mut self, err: &Error) {
        self.settled = true;
        self.registry.record_failure(&self.key, self.trial, err);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.registry.abort_trial(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
        }
    }

    fn fail(registry: &CircuitBreakerRegistry, key: &str) {
        let permit = registry.try_acquire(key).unwrap();
        permit.record_failure(&Error::Timeout("test".into()));
    }

    #[test]
    fn test_state_machine_opens_at_threshold() {
        let config = config(3, 1000);
        let now = Instant::now();
        let mut state = BreakerState::default();
        for i in 1..=3 {
            assert_eq!(state.admit(now), Admission::Allow);
            state = state.next_state(BreakerEvent::Failure, now, &config);
            assert_eq!(state.failure_count, i);
        }
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.next_retry_time, Some(now + config.reset_timeout));
        assert!(matches!(state.admit(now), Admission::Reject { .. }));
        assert_eq!(state.admit(now + config.reset_timeout), Admission::Trial);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let config = config(3, 1000);
        let now = Instant::now();
        let state = BreakerState::default()
            .next_state(BreakerEvent::Failure, now, &config)
            .next_state(BreakerEvent::Failure, now, &config)
            .next_state(BreakerEvent::Success, now, &config)
            .next_state(BreakerEvent::Failure, now, &config);
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 1);
    }

    #[test]
    fn test_half_open_transitions() {
        let config = config(1, 1000);
        let now = Instant::now();
        let open = BreakerState::default().next_state(BreakerEvent::Failure, now, &config);
        let later = now + Duration::from_secs(2);

        let trial = open.next_state(BreakerEvent::TrialStarted, later, &config);
        assert_eq!(trial.state, CircuitState::HalfOpen);
        assert!(matches!(trial.admit(later), Admission::Reject { .. }));

        let closed = trial.next_state(BreakerEvent::Success, later, &config);
        assert_eq!(closed.state, CircuitState::Closed);
        assert_eq!(closed.failure_count, 0);

        let reopened = trial.next_state(BreakerEvent::Failure, later, &config);
        assert_eq!(reopened.state, CircuitState::Open);
        assert_eq!(reopened.next_retry_time, Some(later + config.reset_timeout));

        let abandoned = trial.next_state(BreakerEvent::TrialAbandoned, later, &config);
        assert_eq!(abandoned.state, CircuitState::Open);
        assert_eq!(abandoned.admit(later), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_opens_and_recovers() {
        let registry = CircuitBreakerRegistry::new(config(2, 100));
        let key = "guests.find_many";

        fail(&registry, key);
        assert_eq!(registry.state(key).unwrap().state, CircuitState::Closed);
        fail(&registry, key);
        assert_eq!(registry.state(key).unwrap().state, CircuitState::Open);
        assert_eq!(registry.open_circuits(), vec![key.to_string()]);

        let err = registry.try_acquire(key).err().unwrap();
        assert!(err.is_circuit_open());

        tokio::time::advance(Duration::from_millis(150)).await;

        let trial = registry.try_acquire(key).unwrap();
        assert!(trial.is_trial());
        assert_eq!(registry.state(key).unwrap().state, CircuitState::HalfOpen);
        assert!(registry.try_acquire(key).is_err());

        trial.record_success();
        let snapshot = registry.state(key).unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert!(registry.open_circuits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_reopens_for_next_caller() {
        let registry = CircuitBreakerRegistry::new(config(1, 50));
        let key = "service_requests.count";
        fail(&registry, key);
        tokio::time::advance(Duration::from_millis(60)).await;

        drop(registry.try_acquire(key).unwrap());
        assert_eq!(registry.state(key).unwrap().state, CircuitState::Open);

        let trial = registry.try_acquire(key).unwrap();
        assert!(trial.is_trial());
        trial.record_failure(&Error::ConnectionFailed("down".into()));
        assert!(registry.try_acquire(key).is_err());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let registry = CircuitBreakerRegistry::new(config(1, 60_000));
        fail(&registry, "guests.count");
        assert!(registry.try_acquire("guests.count").is_err());
        assert!(registry.try_acquire("staff_members.count").is_ok());
        assert_eq!(
            registry.keys(),
            vec!["guests.count".to_string(), "staff_members.count".to_string()]
        );

        assert!(registry.reset("guests.count"));
        assert!(registry.try_acquire("guests.count").is_ok());
        assert!(!registry.reset("unknown"));
        assert!(registry.state("unknown").is_none());
    }

    #[test]
    fn test_config_from_lookup_rejects_zero() {
        let config = CircuitBreakerConfig::from_lookup(|key| match key {
            "CONCIERGE_DB_CIRCUIT_FAILURE_THRESHOLD" => Some("0".into()),
            "CONCIERGE_DB_CIRCUIT_RESET_TIMEOUT_MS" => Some("2500".into()),
            _ => None,
        });
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_millis(2500));
    }
}
