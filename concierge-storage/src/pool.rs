//! Bounded connection pool
//!
//! Idle connections are reused LIFO so a small hot set stays warm and the
//! rest can idle-expire. When the pool is at capacity callers queue FIFO and
//! are handed connections directly as they are released.
//!
//! All bookkeeping (idle set, active count, in-flight creations, waiter
//! queue) lives in one `parking_lot` mutex that is never held across an
//! `.await`. Connecting, pinging and closing happen outside it.

use crate::backend::{Connection, ConnectionFactory};
use crate::{Error, Result};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on idle + active + connecting
    pub max_connections: u32,
    /// Connections kept open while the pool is running
    pub min_connections: u32,
    /// Default deadline for [`ConnectionPool::acquire`]
    pub acquire_timeout: Duration,
    /// Idle connections unused for longer are closed (down to `min_connections`)
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are closed and replaced
    pub max_lifetime: Option<Duration>,
    /// Period of the background health check
    pub health_check_interval: Duration,
    /// Deadline for a single health-check ping
    pub health_check_timeout: Duration,
    /// Minimum wait between connection attempts after a failed one
    pub connect_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: None,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            connect_backoff: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    /// Load configuration from `CONCIERGE_DB_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str| {
            lookup(key).and_then(|v| match v.parse::<u64>() {
                Ok(ms) => Some(ms),
                Err(_) => {
                    warn!(key = %key, value = %v, "Ignoring invalid pool setting");
                    None
                }
            })
        };

        let mut max_connections = lookup("CONCIERGE_DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            warn!(
                "Invalid max_connections=0, using default={}",
                defaults.max_connections
            );
            max_connections = defaults.max_connections;
        }

        let mut min_connections = lookup("CONCIERGE_DB_MIN_CONNECTIONS")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.min_connections);
        if min_connections > max_connections {
            warn!(
                min_connections,
                max_connections, "min_connections exceeds max_connections, clamping"
            );
            min_connections = max_connections;
        }

        let acquire_timeout = millis("CONCIERGE_DB_ACQUIRE_TIMEOUT_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.acquire_timeout);

        // 0 disables idle reaping / lifetime limits
        let idle_timeout = match millis("CONCIERGE_DB_IDLE_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.idle_timeout,
        };
        let max_lifetime = match millis("CONCIERGE_DB_MAX_LIFETIME_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.max_lifetime,
        };

        let health_check_interval = millis("CONCIERGE_DB_HEALTH_CHECK_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.health_check_interval);

        Self {
            max_connections,
            min_connections,
            acquire_timeout,
            idle_timeout,
            max_lifetime,
            health_check_interval,
            ..defaults
        }
    }

    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::ValidationError(format!(
                "min_connections ({}) must not exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::ValidationError(
                "acquire_timeout must be greater than zero".to_string(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::ValidationError(
                "health_check_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Observer for connection-level failures seen by the pool
pub trait ConnectionEvents: Send + Sync {
    fn connection_error(&self, error: &Error);
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub idle: u32,
    pub active: u32,
    /// Connections being opened
    pub pending: u32,
    pub waiting: u32,
    pub min_connections: u32,
    pub max_connections: u32,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub failed_connections: u64,
    pub acquire_timeouts: u64,
    pub closed: bool,
}

impl PoolStatus {
    /// Open or opening connections
    pub fn total(&self) -> u32 {
        self.idle + self.active + self.pending
    }

    /// Fraction of capacity checked out by callers
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            self.active as f64 / self.max_connections as f64
        }
    }
}

/// Outcome of one health-check pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Idle connections pinged
    pub checked: u32,
    pub healthy: u32,
    /// Connections that failed the ping and were replaced
    pub failed: u32,
    /// Connections closed for exceeding idle timeout or max lifetime
    pub reaped: u32,
}

struct Slot {
    id: u64,
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct Waiter {
    id: u64,
    sender: oneshot::Sender<Slot>,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Slot>,
    active: u32,
    pending: u32,
    /// Idle connections taken out for a health-check ping
    checking: u32,
    waiters: VecDeque<Waiter>,
    closed: bool,
    next_waiter_id: u64,
    next_connection_id: u64,
    next_connect_at: Option<Instant>,
    total_created: u64,
    total_destroyed: u64,
    failed_connections: u64,
    acquire_timeouts: u64,
}

impl PoolState {
    fn total(&self) -> u32 {
        self.idle.len() as u32 + self.active + self.pending + self.checking
    }

    /// Hand `slot` to the oldest live waiter, or park it as idle
    fn dispatch(&mut self, mut slot: Slot) {
        while let Some(waiter) = self.waiters.pop_front() {
            self.active += 1;
            match waiter.sender.send(slot) {
                Ok(()) => return,
                Err(returned) => {
                    // Waiter gave up (timed out or dropped its acquire future)
                    self.active -= 1;
                    slot = returned;
                }
            }
        }
        self.idle.push(slot);
    }

    fn live_waiters(&self) -> u32 {
        self.waiters.iter().filter(|w| !w.sender.is_closed()).count() as u32
    }

    fn publish(&self) {
        crate::metrics::POOL_IDLE_CONNECTIONS.set(self.idle.len() as i64);
        crate::metrics::POOL_ACTIVE_CONNECTIONS.set(self.active as i64);
        crate::metrics::POOL_WAITING_ACQUIRERS.set(self.waiters.len() as i64);
    }
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    listeners: RwLock<Vec<Arc<dyn ConnectionEvents>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to a connection pool
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend", &self.inner.factory.backend_name())
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Create an empty pool. Connections are opened on demand; use
    /// [`connect`](Self::connect) to open `min_connections` up front.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState::default()),
                listeners: RwLock::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Create a pool and open `min_connections`, failing if the datastore
    /// cannot be reached
    pub async fn connect(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Result<Self> {
        let pool = Self::new(factory, config)?;
        pool.warm_up().await?;
        info!(
            backend = pool.inner.factory.backend_name(),
            min_connections = pool.inner.config.min_connections,
            max_connections = pool.inner.config.max_connections,
            "Connection pool initialized"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Register an observer for connection failures
    pub fn add_listener(&self, listener: Arc<dyn ConnectionEvents>) {
        self.inner.listeners.write().push(listener);
    }

    /// Open connections until the pool holds `min_connections`
    pub async fn warm_up(&self) -> Result<()> {
        let wanted = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            let wanted = self.inner.config.min_connections.saturating_sub(state.total());
            state.pending += wanted;
            wanted
        };

        let results = join_all((0..wanted).map(|_| self.open_slot(None))).await;

        let mut first_error = None;
        {
            let mut state = self.inner.state.lock();
            state.pending -= wanted;
            for result in results {
                match result {
                    Ok(slot) => state.dispatch(slot),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            state.publish();
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Acquire a connection, waiting up to the configured acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquire a connection, waiting up to `timeout`.
    ///
    /// Serves the most recently used idle connection, opens a new one while
    /// below capacity, or queues behind earlier waiters. On timeout the
    /// waiter is removed and [`Error::AcquireTimeout`] is returned.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        enum Next {
            Ready(Slot),
            Create,
            Wait(u64, oneshot::Receiver<Slot>),
        }

        let deadline = Instant::now() + timeout;
        let next = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            let next = if let Some(slot) = state.idle.pop() {
                state.active += 1;
                Next::Ready(slot)
            } else if state.total() < self.inner.config.max_connections {
                state.pending += 1;
                Next::Create
            } else {
                state.waiters.retain(|w| !w.sender.is_closed());
                let (sender, receiver) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back(Waiter { id, sender });
                Next::Wait(id, receiver)
            };
            state.publish();
            next
        };

        match next {
            Next::Ready(slot) => Ok(self.checkout(slot)),
            Next::Create => self.create_for_caller(deadline, timeout).await,
            Next::Wait(id, mut receiver) => {
                match tokio::time::timeout_at(deadline, &mut receiver).await {
                    Ok(Ok(slot)) => Ok(self.checkout(slot)),
                    // Sender dropped: the pool shut down
                    Ok(Err(_)) => Err(Error::PoolClosed),
                    Err(_) => {
                        {
                            let mut state = self.inner.state.lock();
                            state.waiters.retain(|w| w.id != id);
                            state.publish();
                        }
                        // A release may have raced the deadline
                        if let Ok(slot) = receiver.try_recv() {
                            return Ok(self.checkout(slot));
                        }
                        self.inner.state.lock().acquire_timeouts += 1;
                        crate::metrics::POOL_ERRORS_TOTAL
                            .with_label_values(&["acquire_timeout"])
                            .inc();
                        warn!(
                            timeout_ms = timeout.as_millis() as u64,
                            "Timed out waiting for a pooled connection"
                        );
                        Err(Error::AcquireTimeout(timeout))
                    }
                }
            }
        }
    }

    async fn create_for_caller(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PooledConnection> {
        let mut reservation = Reservation {
            pool: self,
            armed: true,
        };
        let slot = match self.open_slot(Some(deadline)).await {
            Ok(slot) => slot,
            Err(Error::Timeout(_)) => {
                drop(reservation);
                self.inner.state.lock().acquire_timeouts += 1;
                return Err(Error::AcquireTimeout(timeout));
            }
            Err(e) => return Err(e),
        };

        let closed = {
            let mut state = self.inner.state.lock();
            state.pending -= 1;
            if !state.closed {
                state.active += 1;
            }
            state.publish();
            state.closed
        };
        reservation.armed = false;
        drop(reservation);
        if closed {
            self.close_detached(slot);
            return Err(Error::PoolClosed);
        }
        Ok(self.checkout(slot))
    }

    fn checkout(&self, mut slot: Slot) -> PooledConnection {
        slot.last_used = Instant::now();
        PooledConnection {
            slot: Some(slot),
            pool: self.clone(),
        }
    }

    /// Open one connection, honoring the post-failure backoff. The caller
    /// owns the `pending` reservation.
    async fn open_slot(&self, deadline: Option<Instant>) -> Result<Slot> {
        let not_before = self.inner.state.lock().next_connect_at;
        if let Some(at) = not_before {
            if deadline.is_some_and(|d| at >= d) {
                return Err(Error::Timeout("connection backoff exceeds deadline".into()));
            }
            tokio::time::sleep_until(at).await;
        }

        let connect = self.inner.factory.connect();
        let result = match deadline {
            Some(d) => match tokio::time::timeout_at(d, connect).await {
                Ok(result) => result,
                Err(_) => return Err(Error::Timeout("opening connection".into())),
            },
            None => connect.await,
        };

        match result {
            Ok(conn) => {
                let now = Instant::now();
                let mut state = self.inner.state.lock();
                let id = state.next_connection_id;
                state.next_connection_id += 1;
                state.total_created += 1;
                state.next_connect_at = None;
                debug!(connection_id = id, "Opened datastore connection");
                Ok(Slot {
                    id,
                    conn,
                    created_at: now,
                    last_used: now,
                })
            }
            Err(e) => {
                {
                    let mut state = self.inner.state.lock();
                    state.failed_connections += 1;
                    state.next_connect_at = Some(Instant::now() + self.inner.config.connect_backoff);
                }
                crate::metrics::POOL_ERRORS_TOTAL
                    .with_label_values(&["connect"])
                    .inc();
                error!(
                    backend = self.inner.factory.backend_name(),
                    error = %e,
                    "Failed to open datastore connection"
                );
                let err = match e {
                    Error::Auth(msg) => Error::Auth(msg),
                    other => Error::FailedConnection(other.to_string()),
                };
                self.notify(&err);
                Err(err)
            }
        }
    }

    fn notify(&self, err: &Error) {
        let listeners = self.inner.listeners.read().clone();
        for listener in listeners {
            listener.connection_error(err);
        }
    }

    /// Return a connection to the pool
    fn release(&self, mut slot: Slot) {
        let now = Instant::now();
        slot.last_used = now;
        let expired = self
            .inner
            .config
            .max_lifetime
            .is_some_and(|max| now.saturating_duration_since(slot.created_at) > max);

        let mut state = self.inner.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.closed || expired {
            state.total_destroyed += 1;
            state.publish();
            drop(state);
            self.close_detached(slot);
            if expired {
                self.replenish();
            }
            return;
        }
        state.dispatch(slot);
        state.publish();
    }

    /// Destroy a checked-out connection and open a replacement
    fn destroy(&self, slot: Slot) {
        {
            let mut state = self.inner.state.lock();
            state.active = state.active.saturating_sub(1);
            state.total_destroyed += 1;
            state.publish();
        }
        crate::metrics::POOL_ERRORS_TOTAL
            .with_label_values(&["invalidated"])
            .inc();
        warn!(connection_id = slot.id, "Connection invalidated, replacing");
        self.close_detached(slot);
        self.replenish();
    }

    fn close_detached(&self, mut slot: Slot) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = slot.conn.close().await {
                    debug!(connection_id = slot.id, error = %e, "Error closing connection");
                }
            });
        }
    }

    /// Open connections in the background until the pool is back at
    /// `min_connections` and every live waiter has one coming
    fn replenish(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let wanted = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            let total = state.total();
            let for_min = self.inner.config.min_connections.saturating_sub(total);
            let for_waiters = state.live_waiters().saturating_sub(state.pending);
            let headroom = self.inner.config.max_connections.saturating_sub(total);
            let wanted = for_min.max(for_waiters).min(headroom);
            state.pending += wanted;
            wanted
        };

        for _ in 0..wanted {
            let pool = self.clone();
            handle.spawn(async move {
                let result = pool.open_slot(None).await;
                let mut state = pool.inner.state.lock();
                state.pending -= 1;
                match result {
                    Ok(slot) if state.closed => {
                        state.total_destroyed += 1;
                        drop(state);
                        pool.close_detached(slot);
                    }
                    Ok(slot) => {
                        state.dispatch(slot);
                        state.publish();
                    }
                    Err(_) => {}
                }
            });
        }
    }

    /// Ping idle connections, replacing the ones that fail, and close idle
    /// connections past their idle timeout or lifetime
    pub async fn health_check(&self) -> HealthReport {
        let config = &self.inner.config;
        let (candidates, reaped) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return HealthReport::default();
            }
            let now = Instant::now();
            let mut total = state.total();
            let mut keep = Vec::with_capacity(state.idle.len());
            let mut reaped = Vec::new();
            // Oldest-used first, so reaping stops at the warmest connections
            for slot in state.idle.drain(..) {
                let too_old = config
                    .max_lifetime
                    .is_some_and(|max| now.saturating_duration_since(slot.created_at) > max);
                let idle_expired = config
                    .idle_timeout
                    .is_some_and(|max| now.saturating_duration_since(slot.last_used) > max);
                if too_old || (idle_expired && total > config.min_connections) {
                    total -= 1;
                    reaped.push(slot);
                } else {
                    keep.push(slot);
                }
            }
            state.total_destroyed += reaped.len() as u64;
            state.checking += keep.len() as u32;
            state.publish();
            (keep, reaped)
        };

        let reaped_count = reaped.len() as u32;
        for slot in reaped {
            debug!(connection_id = slot.id, "Closing expired idle connection");
            self.close_detached(slot);
        }

        let checked = candidates.len() as u32;
        let timeout = config.health_check_timeout;
        let probes = join_all(candidates.into_iter().map(|mut slot| async move {
            let result = match tokio::time::timeout(timeout, slot.conn.ping()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout("health check ping".into())),
            };
            (slot, result)
        }))
        .await;

        let mut failed = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.checking -= checked;
            for (slot, result) in probes {
                match result {
                    Ok(()) if !state.closed => state.dispatch(slot),
                    Ok(()) => {
                        state.total_destroyed += 1;
                        failed.push((slot, None));
                    }
                    Err(e) => {
                        state.total_destroyed += 1;
                        failed.push((slot, Some(e)));
                    }
                }
            }
            state.publish();
        }

        let mut failed_count = 0;
        for (slot, err) in failed {
            if let Some(err) = err {
                failed_count += 1;
                warn!(connection_id = slot.id, error = %err, "Connection failed health check");
                crate::metrics::POOL_ERRORS_TOTAL
                    .with_label_values(&["health_check"])
                    .inc();
                self.notify(&Error::ConnectionFailed(format!(
                    "health check failed: {}",
                    err
                )));
            }
            self.close_detached(slot);
        }
        self.replenish();

        HealthReport {
            checked,
            healthy: checked - failed_count,
            failed: failed_count,
            reaped: reaped_count,
        }
    }

    /// Spawn the periodic health-check task. The task stops when the pool is
    /// shut down or every handle is dropped.
    pub fn start_maintenance(&self) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }
                let report = pool.health_check().await;
                debug!(
                    checked = report.checked,
                    failed = report.failed,
                    reaped = report.reaped,
                    "Pool health check complete"
                );
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    /// Reject queued waiters, close idle connections and stop background
    /// tasks. Checked-out connections are closed as they are returned.
    pub async fn shutdown(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            // Dropping the senders fails every queued acquire with PoolClosed
            state.waiters.clear();
            let idle: Vec<Slot> = state.idle.drain(..).collect();
            state.total_destroyed += idle.len() as u64;
            state.publish();
            idle
        };

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let closed = idle.len();
        join_all(idle.into_iter().map(|mut slot| async move {
            if let Err(e) = slot.conn.close().await {
                debug!(connection_id = slot.id, error = %e, "Error closing connection");
            }
        }))
        .await;

        let active = self.inner.state.lock().active;
        info!(
            closed_idle = closed,
            still_active = active,
            "Connection pool shut down"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len() as u32,
            active: state.active,
            pending: state.pending + state.checking,
            waiting: state.waiters.len() as u32,
            min_connections: self.inner.config.min_connections,
            max_connections: self.inner.config.max_connections,
            total_created: state.total_created,
            total_destroyed: state.total_destroyed,
            failed_connections: state.failed_connections,
            acquire_timeouts: state.acquire_timeouts,
            closed: state.closed,
        }
    }
}

/// Releases a `pending` reservation if connection creation is abandoned
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.pool.inner.state.lock();
            state.pending = state.pending.saturating_sub(1);
        }
        self.pool.replenish();
    }
}

/// A connection checked out of the pool.
///
/// Dereferences to the underlying [`Connection`]. Dropping it returns the
/// connection to the pool; call [`invalidate`](Self::invalidate) instead after
/// a connection-level error.
pub struct PooledConnection {
    slot: Option<Slot>,
    pool: ConnectionPool,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map(|s| s.id).unwrap_or_default()
    }

    /// Time since the connection was opened
    pub fn age(&self) -> Duration {
        self.slot
            .as_ref()
            .map(|s| s.created_at.elapsed())
            .unwrap_or_default()
    }

    /// Return the connection to the pool
    pub fn release(self) {}

    /// Close the connection instead of returning it, and open a replacement
    pub fn invalidate(mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.destroy(slot);
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self
            .slot
            .as_ref()
            .expect("pooled connection used after release")
            .conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self
            .slot
            .as_mut()
            .expect("pooled connection used after release")
            .conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .finish()
    }
}
