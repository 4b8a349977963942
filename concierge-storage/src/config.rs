//! Data layer configuration
//!
//! Each component owns its config struct and env parsing; this module
//! aggregates them and adds the settings that span components.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::monitor::MonitorConfig;
use crate::optimizer::OptimizerConfig;
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to build a [`crate::DataLayer`]
#[derive(Debug, Clone)]
pub struct DataLayerConfig {
    pub database_url: String,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub optimizer: OptimizerConfig,
    pub monitor: MonitorConfig,
    /// Per-statement timeout applied by the executor
    pub query_timeout: Duration,
    /// Run the background monitor loop
    pub enable_monitor: bool,
    /// Apply schema migrations when connecting
    pub run_migrations: bool,
}

impl Default for DataLayerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/concierge".to_string(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            optimizer: OptimizerConfig::default(),
            monitor: MonitorConfig::default(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            enable_monitor: true,
            run_migrations: false,
        }
    }
}

impl DataLayerConfig {
    /// Load from `DATABASE_URL` and `CONCIERGE_DB_*` variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::ValidationError("DATABASE_URL must be set".to_string()))?;

        let query_timeout = match lookup("CONCIERGE_DB_QUERY_TIMEOUT_MS").map(|v| v.parse::<u64>()) {
            Some(Ok(ms)) if ms > 0 => Duration::from_millis(ms),
            Some(_) => {
                warn!(
                    "Invalid query timeout, using default={}ms",
                    DEFAULT_QUERY_TIMEOUT.as_millis()
                );
                DEFAULT_QUERY_TIMEOUT
            }
            None => DEFAULT_QUERY_TIMEOUT,
        };

        let enable_monitor = !matches!(
            lookup("CONCIERGE_DB_MONITOR_ENABLED").as_deref(),
            Some("false") | Some("0")
        );

        let run_migrations = matches!(
            lookup("CONCIERGE_DB_RUN_MIGRATIONS").as_deref(),
            Some("true") | Some("1")
        );

        let config = Self {
            database_url,
            pool: PoolConfig::from_lookup(&lookup),
            retry: RetryPolicy::from_lookup(&lookup),
            circuit_breaker: CircuitBreakerConfig::from_lookup(&lookup),
            optimizer: OptimizerConfig::from_lookup(&lookup),
            monitor: MonitorConfig::from_lookup(&lookup),
            query_timeout,
            enable_monitor,
            run_migrations,
        };
        config.validate()?;

        info!(
            database_url = %mask_password(&config.database_url),
            max_connections = config.pool.max_connections,
            query_timeout_ms = config.query_timeout.as_millis() as u64,
            monitor = config.enable_monitor,
            "Data layer configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.query_timeout.is_zero() {
            return Err(Error::ValidationError(
                "query_timeout must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::ValidationError(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::ValidationError(
                "circuit failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hide the password in a connection URL for logging
pub fn mask_password(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    let Some(at) = url[scheme_end..].find('@').map(|i| i + scheme_end) else {
        return url.to_string();
    };
    match url[scheme_end..at].find(':') {
        Some(colon) => {
            let mut masked = url.to_string();
            masked.replace_range(scheme_end + colon + 1..at, "****");
            masked
        }
        None => url.to_string(),
    }
}
