//! Shared test helpers: an in-memory driver with counters and failure injection.

#![allow(dead_code)]

use async_trait::async_trait;
use db_bridge::db::{ConnectionPool, Driver, DriverRegistry, Session};
use db_bridge::error::{DbError, DbResult};
use db_bridge::models::{
    BackendKind, ColumnMetadata, ConnectionDescriptor, RawConfig, RawResult, RawValue, Statement,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Observable state shared by a mock driver and every session it opens.
#[derive(Debug, Default)]
pub struct MockState {
    pub open_attempts: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    /// Number of upcoming opens that fail with a connection error
    pub failing_opens: AtomicUsize,
    /// Every open fails as if the server refused the credentials
    pub reject_logins: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub ping_fails: AtomicBool,
    pub open_delay: Mutex<Option<Duration>>,
    pub executed: Mutex<Vec<String>>,
}

impl MockState {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

pub struct MockDriver {
    kind: BackendKind,
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new(kind: BackendKind) -> (Arc<dyn Driver>, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let driver = Arc::new(Self {
            kind,
            state: Arc::clone(&state),
        });
        (driver, state)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn open(&self, _descriptor: &ConnectionDescriptor) -> DbResult<Box<dyn Session>> {
        self.state.open_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.reject_logins.load(Ordering::SeqCst) {
            return Err(DbError::connection_rejected(
                "password authentication failed for user \"mock\"",
                "Verify the username and password",
            ));
        }
        let failing = self.state.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(DbError::connection("connection refused", "start the mock"));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
}

#[async_trait]
impl Session for MockSession {
    /// `FAIL...` fails, `SLEEP...` hangs for a minute, `SELECT...` returns one row,
    /// anything else acknowledges one affected row.
    async fn execute(&mut self, statement: &Statement) -> DbResult<RawResult> {
        self.state
            .executed
            .lock()
            .unwrap()
            .push(statement.text.clone());
        let text = statement.text.trim_start();
        if text.starts_with("FAIL") {
            return Err(DbError::database(
                "syntax error near FAIL",
                Some("42601".to_string()),
                "Check the SQL syntax",
            ));
        }
        if text.starts_with("SLEEP") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if text.starts_with("SELECT") {
            return Ok(RawResult::Rows {
                columns: vec![ColumnMetadata::new("n", "INT8", false)],
                rows: vec![vec![RawValue::Int(1)]],
                rows_affected: None,
                last_insert_id: None,
            });
        }
        Ok(RawResult::ack(1))
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        if self.state.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection reset during commit", "retry"));
        }
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection reset during rollback", "retry"));
        }
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&mut self) -> bool {
        !self.state.ping_fails.load(Ordering::SeqCst)
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Host-based PostgreSQL descriptor with short retry delays plus the given options.
pub fn descriptor(options: &[(&str, Value)]) -> ConnectionDescriptor {
    let raw = options.iter().fold(
        RawConfig::new("postgresql")
            .with("host", "mock.internal")
            .with("retry_base_delay_ms", 10)
            .with("retry_max_delay_ms", 40),
        |raw, (key, value)| raw.with(*key, value.clone()),
    );
    ConnectionDescriptor::normalize(raw).unwrap()
}

pub fn mock_pool(options: &[(&str, Value)]) -> (Arc<ConnectionPool>, Arc<MockState>) {
    let (driver, state) = MockDriver::new(BackendKind::PostgreSQL);
    (ConnectionPool::new(descriptor(options), driver), state)
}

pub fn mock_registry() -> (Arc<DriverRegistry>, Arc<MockState>) {
    let (driver, state) = MockDriver::new(BackendKind::PostgreSQL);
    let registry = DriverRegistry::builder().register_arc(driver).build();
    (Arc::new(registry), state)
}

/// Yield until `waiters` acquirers are queued on the pool.
pub async fn wait_for_waiters(pool: &ConnectionPool, waiters: usize) {
    while pool.status().waiters < waiters {
        tokio::task::yield_now().await;
    }
}

/// Let spawned close tasks run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
