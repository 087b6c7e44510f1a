//! Append-only execution audit: one execution row per run, one step row per
//! executed step.

use crate::adapter::adapt_sql_engine;
use crate::classify::split_statements;
use crate::config::EngineConfig;
use crate::db::{DatabaseClient, Row};
use crate::error::{MigrationError, Result};
use crate::model::{
    Direction, MigrationExecutionContext, MigrationResult, PortableMigration, StepResult,
    StepStatus,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Lifecycle of an execution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Started, not finished.
    Running,
    /// Finished; see `success`.
    Completed,
    /// Aborted by an infrastructure error.
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl ExecutionStatus {
    fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }
}

/// One row of the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Row id.
    pub execution_id: String,
    /// Migration id.
    pub migration_id: String,
    /// Plugin id.
    pub plugin_id: String,
    /// Migration version.
    pub version: String,
    /// Direction.
    pub direction: Direction,
    /// Session id.
    pub session_id: String,
    /// Row status.
    pub status: ExecutionStatus,
    /// Result success flag.
    pub success: bool,
    /// Run was a dry run.
    pub dry_run: bool,
    /// Result rollback flag.
    pub rollback_available: bool,
    /// Migration checksum at run time.
    pub checksum: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// First error message, if any.
    pub error: Option<String>,
    /// Who triggered the run.
    pub initiated_by: Option<String>,
}

/// One row of the step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Owning execution.
    pub execution_id: String,
    /// Step id.
    pub step_id: String,
    /// Position in the run.
    pub order_index: usize,
    /// Status.
    pub status: StepStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Rows affected.
    pub rows_affected: u64,
    /// Error text.
    pub error: Option<String>,
    /// Rollback flag.
    pub rollback_available: bool,
}

/// A migration whose latest successful run applied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    /// Migration id.
    pub migration_id: String,
    /// Migration version.
    pub version: String,
    /// When the applying run started.
    pub applied_at: DateTime<Utc>,
}

/// Reads and writes the audit tables.
pub struct ExecutionLog {
    client: Arc<dyn DatabaseClient>,
    execution_table: String,
    step_table: String,
    initialized: OnceCell<()>,
}

impl fmt::Debug for ExecutionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLog")
            .field("execution_table", &self.execution_table)
            .field("step_table", &self.step_table)
            .finish_non_exhaustive()
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_str(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn row_u64(row: &Row, key: &str) -> u64 {
    match row.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

fn row_bool(row: &Row, key: &str) -> bool {
    match row.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(Value::String(s)) => matches!(s.as_str(), "t" | "true" | "1"),
        _ => false,
    }
}

fn row_time(row: &Row, key: &str) -> Option<DateTime<Utc>> {
    row_str(row, key)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn required(row: &Row, key: &str) -> Result<String> {
    row_str(row, key)
        .ok_or_else(|| MigrationError::execution(format!("audit row is missing column {key}")))
}

impl ExecutionLog {
    /// Audit log over `client` using the given table names.
    pub fn new(
        client: Arc<dyn DatabaseClient>,
        execution_table: impl Into<String>,
        step_table: impl Into<String>,
    ) -> Self {
        Self {
            client,
            execution_table: execution_table.into(),
            step_table: step_table.into(),
            initialized: OnceCell::new(),
        }
    }

    /// Audit log using the table names from `config`.
    pub fn from_config(client: Arc<dyn DatabaseClient>, config: &EngineConfig) -> Self {
        Self::new(client, &config.execution_log_table, &config.step_log_table)
    }

    fn ddl(&self) -> String {
        format!(
            r"
            CREATE TABLE IF NOT EXISTS {exec} (
                execution_id VARCHAR(64) PRIMARY KEY,
                migration_id VARCHAR(255) NOT NULL,
                plugin_id VARCHAR(255) NOT NULL,
                version VARCHAR(64) NOT NULL,
                direction VARCHAR(8) NOT NULL,
                session_id VARCHAR(64) NOT NULL,
                status VARCHAR(20) NOT NULL,
                success BOOLEAN NOT NULL DEFAULT FALSE,
                dry_run BOOLEAN NOT NULL DEFAULT FALSE,
                rollback_available BOOLEAN NOT NULL DEFAULT FALSE,
                checksum VARCHAR(64) NOT NULL,
                started_at VARCHAR(40) NOT NULL,
                completed_at VARCHAR(40),
                duration_ms BIGINT NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                initiated_by VARCHAR(255),
                UNIQUE (migration_id, plugin_id, direction, session_id)
            );

            CREATE INDEX IF NOT EXISTS idx_{exec}_plugin ON {exec}(plugin_id);
            CREATE INDEX IF NOT EXISTS idx_{exec}_migration ON {exec}(migration_id);

            CREATE TABLE IF NOT EXISTS {step} (
                id BIGSERIAL PRIMARY KEY,
                execution_id VARCHAR(64) NOT NULL REFERENCES {exec}(execution_id),
                step_id VARCHAR(255) NOT NULL,
                order_index BIGINT NOT NULL,
                status VARCHAR(20) NOT NULL,
                started_at VARCHAR(40) NOT NULL,
                duration_ms BIGINT NOT NULL DEFAULT 0,
                rows_affected BIGINT NOT NULL DEFAULT 0,
                error TEXT,
                rollback_available BOOLEAN NOT NULL DEFAULT FALSE
            );

            CREATE INDEX IF NOT EXISTS idx_{step}_execution ON {step}(execution_id);
            ",
            exec = self.execution_table,
            step = self.step_table,
        )
    }

    /// Create the audit tables if they do not exist. Runs once per instance.
    pub async fn ensure_tables(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                let engine = self.client.engine();
                let ddl = adapt_sql_engine(&self.ddl(), engine);
                for statement in split_statements(&ddl) {
                    self.client.execute(&statement, &[]).await?;
                }
                tracing::debug!(engine = %engine, table = %self.execution_table, "Audit tables ready");
                Ok::<(), MigrationError>(())
            })
            .await?;
        Ok(())
    }

    fn placeholders(&self, count: usize) -> String {
        let engine = self.client.engine();
        (1..=count)
            .map(|i| engine.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Insert the execution row for a starting run. Returns its id.
    pub async fn start_execution(
        &self,
        migration: &PortableMigration,
        context: &MigrationExecutionContext,
    ) -> Result<String> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let sql = format!(
            "INSERT INTO {} (execution_id, migration_id, plugin_id, version, direction, session_id, \
             status, dry_run, checksum, started_at, initiated_by) VALUES ({})",
            self.execution_table,
            self.placeholders(11)
        );
        let params = [
            json!(execution_id),
            json!(migration.id),
            json!(migration.plugin_id),
            json!(migration.version),
            json!(context.direction.to_string()),
            json!(context.session_id),
            json!(ExecutionStatus::Running.to_string()),
            json!(context.dry_run),
            json!(migration.checksum()),
            json!(timestamp(Utc::now())),
            json!(context.initiated_by),
        ];
        self.client.execute(&sql, &params).await?;
        Ok(execution_id)
    }

    /// Append a step row.
    pub async fn record_step(&self, execution_id: &str, step: &StepResult) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (execution_id, step_id, order_index, status, started_at, duration_ms, \
             rows_affected, error, rollback_available) VALUES ({})",
            self.step_table,
            self.placeholders(9)
        );
        let params = [
            json!(execution_id),
            json!(step.step_id),
            json!(step.order_index),
            json!(step.status.to_string()),
            json!(timestamp(step.started_at)),
            json!(step.duration_ms),
            json!(step.rows_affected),
            json!(step.error),
            json!(step.rollback_available),
        ];
        self.client.execute(&sql, &params).await?;
        Ok(())
    }

    /// Write the final outcome onto the execution row.
    pub async fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        result: &MigrationResult,
    ) -> Result<()> {
        let engine = self.client.engine();
        let p = |i| engine.placeholder(i);
        let sql = format!(
            "UPDATE {} SET status = {}, success = {}, rollback_available = {}, completed_at = {}, \
             duration_ms = {}, result = {}, error = {} WHERE execution_id = {}",
            self.execution_table,
            p(1),
            p(2),
            p(3),
            p(4),
            p(5),
            p(6),
            p(7),
            p(8)
        );
        let completed_at = result.completed_at.unwrap_or_else(Utc::now);
        let params = [
            json!(status.to_string()),
            json!(result.success),
            json!(result.rollback_available),
            json!(timestamp(completed_at)),
            json!(result.duration_ms),
            json!(serde_json::to_string(result)?),
            json!(result.errors.first().map(|e| format!("{}: {}", e.code, e.message))),
            json!(execution_id),
        ];
        self.client.execute(&sql, &params).await?;
        Ok(())
    }

    fn select_columns() -> &'static str {
        "execution_id, migration_id, plugin_id, version, direction, session_id, status, success, \
         dry_run, rollback_available, checksum, started_at, completed_at, duration_ms, error, \
         initiated_by"
    }

    fn parse_record(row: &Row) -> Result<ExecutionRecord> {
        let direction = required(row, "direction")?.parse()?;
        Ok(ExecutionRecord {
            execution_id: required(row, "execution_id")?,
            migration_id: required(row, "migration_id")?,
            plugin_id: required(row, "plugin_id")?,
            version: required(row, "version")?,
            direction,
            session_id: required(row, "session_id")?,
            status: ExecutionStatus::parse(&required(row, "status")?),
            success: row_bool(row, "success"),
            dry_run: row_bool(row, "dry_run"),
            rollback_available: row_bool(row, "rollback_available"),
            checksum: row_str(row, "checksum").unwrap_or_default(),
            started_at: row_time(row, "started_at").unwrap_or_else(Utc::now),
            completed_at: row_time(row, "completed_at"),
            duration_ms: row_u64(row, "duration_ms"),
            error: row_str(row, "error"),
            initiated_by: row_str(row, "initiated_by"),
        })
    }

    /// Most recent successful non-dry-run execution of a migration, any direction.
    pub async fn last_successful_execution(&self, migration_id: &str) -> Result<Option<ExecutionRecord>> {
        let engine = self.client.engine();
        let sql = format!(
            "SELECT {} FROM {} WHERE migration_id = {} AND success = {} AND dry_run = {} \
             ORDER BY started_at DESC",
            Self::select_columns(),
            self.execution_table,
            engine.placeholder(1),
            engine.placeholder(2),
            engine.placeholder(3)
        );
        let row = self
            .client
            .query_one(&sql, &[json!(migration_id), json!(true), json!(false)])
            .await?;
        row.as_ref().map(Self::parse_record).transpose()
    }

    /// Migrations of a plugin currently applied, oldest application first.
    ///
    /// Replays successful non-dry-run executions in start order: `up`
    /// applies, `down` reverts.
    pub async fn applied_migrations(&self, plugin_id: &str) -> Result<Vec<AppliedMigration>> {
        let engine = self.client.engine();
        let sql = format!(
            "SELECT {} FROM {} WHERE plugin_id = {} AND success = {} AND dry_run = {} \
             ORDER BY started_at ASC",
            Self::select_columns(),
            self.execution_table,
            engine.placeholder(1),
            engine.placeholder(2),
            engine.placeholder(3)
        );
        let rows = self
            .client
            .query(&sql, &[json!(plugin_id), json!(true), json!(false)])
            .await?;

        let mut applied: Vec<AppliedMigration> = Vec::new();
        for row in &rows {
            let record = Self::parse_record(row)?;
            applied.retain(|a| a.migration_id != record.migration_id);
            if record.direction == Direction::Up {
                applied.push(AppliedMigration {
                    migration_id: record.migration_id,
                    version: record.version,
                    applied_at: record.started_at,
                });
            }
        }
        Ok(applied)
    }

    /// Execution rows, newest first, optionally for one plugin.
    pub async fn status(&self, plugin_id: Option<&str>) -> Result<Vec<ExecutionRecord>> {
        let (filter, params) = match plugin_id {
            Some(id) => (
                format!(" WHERE plugin_id = {}", self.client.engine().placeholder(1)),
                vec![json!(id)],
            ),
            None => (String::new(), Vec::new()),
        };
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY started_at DESC",
            Self::select_columns(),
            self.execution_table,
            filter
        );
        self.client
            .query(&sql, &params)
            .await?
            .iter()
            .map(Self::parse_record)
            .collect()
    }

    /// Step rows of one execution, by `order_index`.
    pub async fn step_history(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        let sql = format!(
            "SELECT execution_id, step_id, order_index, status, started_at, duration_ms, \
             rows_affected, error, rollback_available FROM {} WHERE execution_id = {} \
             ORDER BY order_index ASC",
            self.step_table,
            self.client.engine().placeholder(1)
        );
        let rows = self.client.query(&sql, &[json!(execution_id)]).await?;
        rows.iter()
            .map(|row| {
                let status = match required(row, "status")?.as_str() {
                    "success" => StepStatus::Success,
                    "skipped" => StepStatus::Skipped,
                    _ => StepStatus::Failed,
                };
                Ok(StepRecord {
                    execution_id: required(row, "execution_id")?,
                    step_id: required(row, "step_id")?,
                    order_index: row_u64(row, "order_index") as usize,
                    status,
                    started_at: row_time(row, "started_at").unwrap_or_else(Utc::now),
                    duration_ms: row_u64(row, "duration_ms"),
                    rows_affected: row_u64(row, "rows_affected"),
                    error: row_str(row, "error"),
                    rollback_available: row_bool(row, "rollback_available"),
                })
            })
            .collect()
    }
}
