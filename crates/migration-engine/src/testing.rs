//! Recording database double for unit tests.

use crate::config::DatabaseEngine;
use crate::db::{DatabaseClient, DatabaseTransaction, Row};
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    executed: Vec<String>,
    queries: Vec<String>,
    failures: Vec<String>,
    responses: Vec<(String, Vec<Row>)>,
    tables: Vec<String>,
    rows_affected: u64,
    delay: Option<(String, Duration)>,
}

/// Records every statement; fails statements containing a configured pattern.
#[derive(Debug, Clone)]
pub(crate) struct MockDatabase {
    engine: DatabaseEngine,
    state: Arc<Mutex<State>>,
}

impl MockDatabase {
    pub(crate) fn new(engine: DatabaseEngine) -> Self {
        Self {
            engine,
            state: Arc::new(Mutex::new(State {
                rows_affected: 1,
                ..State::default()
            })),
        }
    }

    /// Fail any statement or query containing `pattern`.
    pub(crate) fn fail_on(self, pattern: &str) -> Self {
        self.state.lock().failures.push(pattern.to_string());
        self
    }

    /// Answer queries containing `pattern` with `rows`.
    pub(crate) fn respond(self, pattern: &str, rows: Vec<Row>) -> Self {
        self.state.lock().responses.push((pattern.to_string(), rows));
        self
    }

    /// Tables reported by `list_tables`.
    pub(crate) fn with_tables(self, tables: &[&str]) -> Self {
        self.state.lock().tables = tables.iter().map(ToString::to_string).collect();
        self
    }

    /// Sleep before running statements containing `pattern`.
    pub(crate) fn delay_on(self, pattern: &str, delay: Duration) -> Self {
        self.state.lock().delay = Some((pattern.to_string(), delay));
        self
    }

    /// Every executed statement, including transaction markers.
    pub(crate) fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// Executed statements containing `pattern`.
    pub(crate) fn executed_matching(&self, pattern: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|s| s.contains(pattern))
            .collect()
    }

    /// Every query issued.
    pub(crate) fn queries(&self) -> Vec<String> {
        self.state.lock().queries.clone()
    }

    async fn run(state: &Mutex<State>, sql: &str) -> Result<u64> {
        let delay = state
            .lock()
            .delay
            .clone()
            .filter(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, d)| d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = state.lock();
        state.executed.push(sql.to_string());
        if state.failures.iter().any(|p| sql.contains(p.as_str())) {
            return Err(MigrationError::execution(format!("mock failure: {sql}")));
        }
        Ok(state.rows_affected)
    }

    fn answer(state: &Mutex<State>, sql: &str) -> Result<Vec<Row>> {
        let mut state = state.lock();
        state.queries.push(sql.to_string());
        if state.failures.iter().any(|p| sql.contains(p.as_str())) {
            return Err(MigrationError::execution(format!("mock failure: {sql}")));
        }
        Ok(state
            .responses
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl DatabaseClient for MockDatabase {
    fn engine(&self) -> DatabaseEngine {
        self.engine
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Self::answer(&self.state, sql)
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        Self::run(&self.state, sql).await
    }

    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>> {
        self.state.lock().executed.push("BEGIN".to_string());
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
        }))
    }

    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .tables
            .iter()
            .filter(|t| t.starts_with(prefix))
            .cloned()
            .collect())
    }
}

struct MockTransaction {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl DatabaseTransaction for MockTransaction {
    async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64> {
        MockDatabase::run(&self.state, sql).await
    }

    async fn query(&mut self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        MockDatabase::answer(&self.state, sql)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.state.lock().executed.push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.state.lock().executed.push("ROLLBACK".to_string());
        Ok(())
    }
}

/// Build a row from a JSON object literal.
pub(crate) fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}
