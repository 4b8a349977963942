//! Fault-injecting backend shared by the chaos tests

use async_trait::async_trait;
use concierge_storage::{Connection, ConnectionFactory, Error, Record, Result, Statement};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct ChaosState {
    /// Added to every fetch/execute
    pub latency: Mutex<Duration>,
    /// Number of upcoming statements that fail with a connection reset
    pub failing_statements: AtomicU32,
    pub refuse_connects: AtomicBool,
    pub opened: AtomicU32,
    pub closed: AtomicU32,
    pub statements: AtomicU32,
}

impl ChaosState {
    pub fn live(&self) -> u32 {
        self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct ChaosBackend {
    pub state: Arc<ChaosState>,
}

impl ChaosBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }

    pub fn fail_next(&self, n: u32) {
        self.state.failing_statements.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.state.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    pub fn statements(&self) -> u32 {
        self.state.statements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for ChaosBackend {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        if self.state.refuse_connects.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("connection refused".into()));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ChaosConnection {
            state: self.state.clone(),
            closed: false,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "chaos"
    }
}

struct ChaosConnection {
    state: Arc<ChaosState>,
    closed: bool,
}

impl ChaosConnection {
    async fn run(&mut self) -> Result<()> {
        self.state.statements.fetch_add(1, Ordering::SeqCst);
        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let fail = self
            .state
            .failing_statements
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::ConnectionFailed("connection reset by peer".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for ChaosConnection {
    async fn fetch(&mut self, _statement: &Statement) -> Result<Vec<Record>> {
        self.run().await?;
        match json!({"id": 1, "tenant_id": "hotel-a"}) {
            serde_json::Value::Object(row) => Ok(vec![row]),
            _ => unreachable!(),
        }
    }

    async fn execute(&mut self, _statement: &Statement) -> Result<u64> {
        self.run().await?;
        Ok(1)
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
