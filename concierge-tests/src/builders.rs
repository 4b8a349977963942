//! Type-safe builders for constructing test objects
//!
//! Builders provide a fluent API for constructing complex test objects
//! with clear, readable code.

use crate::mocks::MemoryDatastore;
use concierge_storage::monitor::AlertRule;
use concierge_storage::{DataLayer, DataLayerConfig, Result};
use std::time::Duration;

/// Builder for a [`DataLayer`] running over a [`MemoryDatastore`]
///
/// Defaults are tuned for tests: a small pool, fast retries, no background
/// monitor loop and no storage probe.
pub struct TestLayerBuilder {
    store: MemoryDatastore,
    config: DataLayerConfig,
}

impl Default for TestLayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLayerBuilder {
    pub fn new() -> Self {
        let mut config = DataLayerConfig {
            database_url: "memory://concierge".to_string(),
            enable_monitor: false,
            query_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        config.pool.max_connections = 4;
        config.pool.min_connections = 1;
        config.pool.acquire_timeout = Duration::from_secs(2);
        config.pool.connect_backoff = Duration::from_millis(10);
        config.retry.max_attempts = 3;
        config.retry.base_delay = Duration::from_millis(5);
        config.retry.max_delay = Duration::from_millis(50);
        config.monitor.storage_probe = false;

        Self {
            store: MemoryDatastore::new(),
            config,
        }
    }

    /// Use an existing datastore (e.g. one already seeded)
    pub fn store(mut self, store: MemoryDatastore) -> Self {
        self.store = store;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.pool.max_connections = max;
        self.config.pool.min_connections = self.config.pool.min_connections.min(max);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.acquire_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    /// Circuit breaker threshold and reset timeout
    pub fn circuit(mut self, failure_threshold: u32, reset_timeout: Duration) -> Self {
        self.config.circuit_breaker.failure_threshold = failure_threshold;
        self.config.circuit_breaker.reset_timeout = reset_timeout;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.config.query_timeout = timeout;
        self
    }

    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.config.optimizer.slow_query_threshold = threshold;
        self
    }

    /// Replace the alert rules evaluated by the monitor
    pub fn alert_rules(mut self, rules: Vec<AlertRule>) -> Self {
        self.config.monitor.rules = rules;
        self
    }

    pub fn storage_probe(mut self, enabled: bool) -> Self {
        self.config.monitor.storage_probe = enabled;
        self
    }

    /// Run the background monitor loop at `interval`
    pub fn monitor_every(mut self, interval: Duration) -> Self {
        self.config.enable_monitor = true;
        self.config.monitor.interval = interval;
        self
    }

    pub fn config(&self) -> &DataLayerConfig {
        &self.config
    }

    pub async fn build(self) -> Result<TestLayer> {
        let layer = DataLayer::with_factory(self.store.factory(), self.config).await?;
        Ok(TestLayer {
            layer,
            store: self.store,
        })
    }
}

/// A data layer together with the datastore behind it
pub struct TestLayer {
    pub layer: DataLayer,
    pub store: MemoryDatastore,
}

impl std::ops::Deref for TestLayer {
    type Target = DataLayer;

    fn deref(&self) -> &Self::Target {
        &self.layer
    }
}
