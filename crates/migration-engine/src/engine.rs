//! Migration orchestrator.

use crate::adapter::FormatAdapter;
use crate::audit::{ExecutionLog, ExecutionRecord, ExecutionStatus, StepRecord};
use crate::backup::{BackupManager, FileBackupManager};
use crate::catalog::{DirectoryCatalog, InMemoryCatalog, MigrationCatalog};
use crate::classify::{split_statements, HeuristicClassifier, SqlClassifier, StatementKind};
use crate::config::{DatabaseEngine, EngineConfig};
use crate::db::{DatabaseClient, DatabaseTransaction, Row, SqlxDatabase};
use crate::error::{MigrationError, Result};
use crate::expression::Expression;
use crate::model::{
    parse_version, ChangeSummary, DataExport, DataImport, DataTransform, Direction, ErrorCode,
    ExecutionError, Expectation, FieldTransform, ImportResult, MigrationExecutionContext,
    MigrationPlan, MigrationResult, MigrationStep, MigrationValidation, PortableMigration,
    RecordError, StepAction, StepResult, StepStatus, ValidationCheck, ValidationIssue,
};
use crate::plugins::PluginRegistry;
use crate::resolver::{resolve_with_applied, AppliedState, DependencyResolver};
use crate::validator::MigrationValidator;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// A running session as reported by [`MigrationEngine::active_sessions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Session id.
    pub session_id: String,
    /// Migration being executed.
    pub migration_id: String,
    /// Plugin.
    pub plugin_id: String,
    /// Direction.
    pub direction: Direction,
    /// Registration time.
    pub started_at: DateTime<Utc>,
    /// Cancellation was requested.
    pub cancelled: bool,
}

#[derive(Debug)]
struct SessionHandle {
    migration_id: String,
    plugin_id: String,
    direction: Direction,
    started_at: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

/// Removes its session from the table when dropped.
struct SessionGuard<'a> {
    sessions: &'a DashMap<String, SessionHandle>,
    session_id: String,
    cancelled: Arc<AtomicBool>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions.remove(&self.session_id);
    }
}

/// Where a step's statements go.
enum Target<'a> {
    Client(&'a dyn DatabaseClient),
    Tx(&'a mut dyn DatabaseTransaction),
}

impl Target<'_> {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        match self {
            Self::Client(client) => client.execute(sql, params).await,
            Self::Tx(tx) => tx.execute(sql, params).await,
        }
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        match self {
            Self::Client(client) => client.query(sql, params).await,
            Self::Tx(tx) => tx.query(sql, params).await,
        }
    }
}

struct StepOutcome {
    status: StepStatus,
    rows: u64,
    changes: ChangeSummary,
}

impl StepOutcome {
    fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            rows: 0,
            changes: ChangeSummary::default(),
        }
    }

    fn noop() -> Self {
        Self {
            status: StepStatus::Success,
            rows: 0,
            changes: ChangeSummary::default(),
        }
    }
}

enum MappedValue {
    Direct(String),
    Constant(Value),
    Expression(Expression),
}

/// Builder for [`MigrationEngine`].
pub struct MigrationEngineBuilder {
    config: EngineConfig,
    client: Arc<dyn DatabaseClient>,
    classifier: Option<Arc<dyn SqlClassifier>>,
    backups: Option<Arc<dyn BackupManager>>,
    catalog: Option<Arc<dyn MigrationCatalog>>,
    plugins: Option<Arc<dyn PluginRegistry>>,
}

impl MigrationEngineBuilder {
    /// Replace the SQL classifier.
    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn SqlClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Replace the backup manager.
    #[must_use]
    pub fn backup_manager(mut self, backups: Arc<dyn BackupManager>) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Replace the migration catalog.
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn MigrationCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Attach a plugin registry, used for installed versions when planning.
    #[must_use]
    pub fn plugin_registry(mut self, plugins: Arc<dyn PluginRegistry>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Build the engine.
    ///
    /// Without explicit collaborators the engine uses the heuristic
    /// classifier, file backups under `config.backup_dir` and a directory
    /// catalog when `config.catalog_dir` is set (in-memory otherwise).
    pub fn build(self) -> MigrationEngine {
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(HeuristicClassifier::new()));
        let backups = self.backups.unwrap_or_else(|| {
            Arc::new(FileBackupManager::new(
                self.config.backup_dir.clone(),
                Arc::clone(&self.client),
                Arc::clone(&classifier),
            ))
        });
        let catalog: Arc<dyn MigrationCatalog> = match (self.catalog, &self.config.catalog_dir) {
            (Some(catalog), _) => catalog,
            (None, Some(dir)) => Arc::new(DirectoryCatalog::new(dir.clone())),
            (None, None) => Arc::new(InMemoryCatalog::new()),
        };
        let adapter = FormatAdapter::new(classifier);

        MigrationEngine {
            log: ExecutionLog::from_config(Arc::clone(&self.client), &self.config),
            validator: MigrationValidator::new(self.config.performance_warning_threshold),
            resolver: DependencyResolver::new(adapter.clone()),
            adapter,
            backups,
            catalog,
            plugins: self.plugins,
            client: self.client,
            config: self.config,
            sessions: DashMap::new(),
            plugin_locks: DashMap::new(),
        }
    }
}

/// Executes, plans, rolls back and transfers plugin migrations.
pub struct MigrationEngine {
    config: EngineConfig,
    client: Arc<dyn DatabaseClient>,
    adapter: FormatAdapter,
    resolver: DependencyResolver,
    validator: MigrationValidator,
    backups: Arc<dyn BackupManager>,
    catalog: Arc<dyn MigrationCatalog>,
    plugins: Option<Arc<dyn PluginRegistry>>,
    log: ExecutionLog,
    sessions: DashMap<String, SessionHandle>,
    plugin_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("engine", &self.client.engine())
            .field("active_sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl MigrationEngine {
    /// Start building an engine over `client`.
    pub fn builder(config: EngineConfig, client: Arc<dyn DatabaseClient>) -> MigrationEngineBuilder {
        MigrationEngineBuilder {
            config,
            client,
            classifier: None,
            backups: None,
            catalog: None,
            plugins: None,
        }
    }

    /// Validate `config`, connect through sqlx and build an engine with defaults.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let client = SqlxDatabase::connect(&config).await?;
        Ok(Self::builder(config, Arc::new(client)).build())
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Database client.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn DatabaseClient> {
        &self.client
    }

    /// Format adapter sharing this engine's classifier.
    #[must_use]
    pub fn adapter(&self) -> &FormatAdapter {
        &self.adapter
    }

    /// Validator configured with this engine's thresholds.
    #[must_use]
    pub fn validator(&self) -> &MigrationValidator {
        &self.validator
    }

    /// Migration catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn MigrationCatalog> {
        &self.catalog
    }

    /// Backup manager.
    #[must_use]
    pub fn backups(&self) -> &Arc<dyn BackupManager> {
        &self.backups
    }

    /// Engine of the connected database.
    #[must_use]
    pub fn database_engine(&self) -> DatabaseEngine {
        self.client.engine()
    }

    /// Create the audit tables if needed.
    pub async fn init(&self) -> Result<()> {
        self.log.ensure_tables().await
    }

    // ------------------------------------------------------------------
    // Sessions and locking
    // ------------------------------------------------------------------

    fn register_session(
        &self,
        migration: &PortableMigration,
        context: &MigrationExecutionContext,
    ) -> Result<SessionGuard<'_>> {
        let cancelled = Arc::new(AtomicBool::new(false));
        match self.sessions.entry(context.session_id.clone()) {
            Entry::Occupied(_) => {
                return Err(MigrationError::DuplicateSession(context.session_id.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionHandle {
                    migration_id: migration.id.clone(),
                    plugin_id: migration.plugin_id.clone(),
                    direction: context.direction,
                    started_at: Utc::now(),
                    cancelled: Arc::clone(&cancelled),
                });
            }
        }
        Ok(SessionGuard {
            sessions: &self.sessions,
            session_id: context.session_id.clone(),
            cancelled,
        })
    }

    /// Request cancellation of a running session.
    ///
    /// The run stops before its next step. Returns `false` if no such
    /// session is running.
    pub fn cancel_session(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(handle) => {
                handle.cancelled.store(true, Ordering::SeqCst);
                info!(session_id = %session_id, migration_id = %handle.migration_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Sessions currently executing, oldest first.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo {
                session_id: entry.key().clone(),
                migration_id: entry.migration_id.clone(),
                plugin_id: entry.plugin_id.clone(),
                direction: entry.direction,
                started_at: entry.started_at,
                cancelled: entry.cancelled.load(Ordering::SeqCst),
            })
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    async fn lock_plugin(&self, plugin_id: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = Arc::clone(
            self.plugin_locks
                .entry(plugin_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        tokio::time::timeout(self.config.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                MigrationError::LockFailed(format!(
                    "plugin {plugin_id} is locked by another run (waited {:?})",
                    self.config.lock_timeout
                ))
            })
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Execute one migration in the context's direction.
    ///
    /// Validation failures, critical conflicts and a missing `down` sequence
    /// are returned as errors before any step runs. Step failures are
    /// recorded inside the returned result. Infrastructure failures are
    /// recorded as `MIGRATION_FAILED`, persisted, then returned as errors.
    pub async fn execute_migration(
        &self,
        migration: &PortableMigration,
        context: &MigrationExecutionContext,
    ) -> Result<MigrationResult> {
        if !context.dry_run && context.database_engine != self.client.engine() {
            return Err(MigrationError::config(format!(
                "context targets {} but the connected database is {}",
                context.database_engine,
                self.client.engine()
            )));
        }

        let session = self.register_session(migration, context)?;
        let _lock = self.lock_plugin(&migration.plugin_id).await?;
        self.log.ensure_tables().await?;

        let execution_id = self.log.start_execution(migration, context).await?;
        info!(
            migration_id = %migration.id,
            plugin_id = %migration.plugin_id,
            session_id = %context.session_id,
            direction = %context.direction,
            dry_run = context.dry_run,
            "Executing migration"
        );

        let started = Instant::now();
        let mut result = MigrationResult::start(migration, context);
        let warnings = self.preflight(migration, context).await?;
        result.warnings.extend(warnings);
        if !context.dry_run {
            self.catalog.register(migration).await?;
        }

        match self
            .run(migration, context, &session.cancelled, started, &mut result)
            .await
        {
            Ok(()) => {
                result.finish(started.elapsed());
                self.persist(&execution_id, ExecutionStatus::Completed, &result)
                    .await?;
                info!(
                    migration_id = %migration.id,
                    session_id = %context.session_id,
                    success = result.success,
                    successful = result.successful_steps,
                    failed = result.failed_steps,
                    skipped = result.skipped_steps,
                    duration_ms = result.duration_ms,
                    "Migration finished"
                );
                Ok(result)
            }
            Err(err) => {
                result
                    .errors
                    .push(ExecutionError::new(ErrorCode::MigrationFailed, err.to_string()));
                result.finish(started.elapsed());
                if let Err(log_err) = self
                    .persist(&execution_id, ExecutionStatus::Failed, &result)
                    .await
                {
                    warn!(execution_id = %execution_id, error = %log_err, "Failed to persist failed execution");
                }
                error!(
                    migration_id = %migration.id,
                    session_id = %context.session_id,
                    error = %err,
                    "Migration aborted"
                );
                Err(err)
            }
        }
    }

    /// Checks that reject a run before any step executes. Returns warnings.
    async fn preflight(
        &self,
        migration: &PortableMigration,
        context: &MigrationExecutionContext,
    ) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if context.direction == Direction::Down && migration.down.is_empty() {
            return Err(MigrationError::RollbackNotSupported {
                id: migration.id.clone(),
                reason: "migration has no down steps".to_string(),
            });
        }

        if !context.options.skip_validation {
            let report = self
                .validator
                .validate_migration(migration, context.database_engine);
            if !report.valid {
                warn!(migration_id = %migration.id, errors = report.errors.len(), "Migration failed validation");
                return Err(MigrationError::ValidationFailed {
                    migration_id: migration.id.clone(),
                    errors: report.error_messages(),
                });
            }
            warnings.extend(report.warnings.iter().map(ToString::to_string));
        }

        let applied = self.applied_state(&migration.plugin_id).await?;
        let conflicts = self
            .resolver
            .detect_conflicts(migration, &applied, context.direction);
        let critical: Vec<_> = conflicts.iter().filter(|c| c.is_critical()).cloned().collect();
        if !critical.is_empty() && !context.force {
            warn!(migration_id = %migration.id, conflicts = critical.len(), "Critical conflicts detected");
            return Err(MigrationError::ConflictDetected {
                migration_id: migration.id.clone(),
                conflicts: critical,
            });
        }
        warnings.extend(conflicts.iter().map(|c| format!("conflict: {c}")));

        Ok(warnings)
    }

    /// What the plugin's applied migrations did, replayed from the log.
    async fn applied_state(&self, plugin_id: &str) -> Result<AppliedState> {
        let mut state = AppliedState::new();
        for applied in self.log.applied_migrations(plugin_id).await? {
            match self.catalog.get(&applied.migration_id).await {
                Ok(migration) => state.record(&migration, &self.adapter),
                Err(MigrationError::NotFound { .. }) => state.mark_applied(applied.migration_id),
                Err(e) => return Err(e),
            }
        }
        Ok(state)
    }

    async fn run(
        &self,
        migration: &PortableMigration,
        context: &MigrationExecutionContext,
        cancelled: &AtomicBool,
        started: Instant,
        result: &mut MigrationResult,
    ) -> Result<()> {
        if migration.requires_backup && !context.options.skip_backup {
            if context.dry_run {
                result
                    .warnings
                    .push("backup skipped: dry run does not modify data".to_string());
            } else {
                let backup = self.backups.create_backup(migration, context).await?;
                result.backup_created = true;
                result.backup_location = Some(backup.location);
            }
        }

        let deadline = context.options.timeout.map(|t| started + t);
        let mut outer = if context.options.atomic && !context.dry_run {
            Some(self.client.begin().await?)
        } else {
            None
        };

        for (index, step) in migration.steps(context.direction).iter().enumerate() {
            if cancelled.load(Ordering::SeqCst) {
                result.metadata.cancelled = true;
                result.errors.push(ExecutionError::new(
                    ErrorCode::Cancelled,
                    format!("session cancelled before step {}", step.id),
                ));
                break;
            }

            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => {
                        Self::record_timeout(result, step, None);
                        break;
                    }
                },
                None => None,
            };

            let step_started = Utc::now();
            let clock = Instant::now();
            let run = self.run_step(step, context, outer.as_mut());
            let outcome = match remaining {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            };
            let Some(outcome) = outcome else {
                Self::record_timeout(result, step, Some((index, step_started, clock)));
                break;
            };

            let (status, rows, error) = match outcome {
                Ok(done) => {
                    result.changes.absorb(&done.changes);
                    (done.status, done.rows, None)
                }
                Err(err) => (StepStatus::Failed, 0, Some(err)),
            };

            result.record_step(StepResult {
                step_id: step.id.clone(),
                order_index: index,
                status,
                started_at: step_started,
                duration_ms: clock.elapsed().as_millis() as u64,
                rows_affected: rows,
                error: error.as_ref().map(ToString::to_string),
                rollback_available: step.rollback_supported,
            });

            if let Some(err) = error {
                if err.is_infrastructure() {
                    return Err(err);
                }
                warn!(
                    migration_id = %migration.id,
                    step_id = %step.id,
                    skip_on_error = step.skip_on_error,
                    error = %err,
                    "Step failed"
                );
                result
                    .errors
                    .push(ExecutionError::step_failed(&step.id, err.to_string()));
                if !step.skip_on_error {
                    break;
                }
            } else {
                debug!(migration_id = %migration.id, step_id = %step.id, status = %status, rows, "Step finished");
            }
        }

        if let Some(tx) = outer {
            let clean = result.failed_steps == 0
                && !result.metadata.cancelled
                && !result.metadata.timed_out;
            if clean {
                tx.commit().await?;
            } else {
                tx.rollback().await?;
                result
                    .warnings
                    .push("atomic run rolled back: no step changes were kept".to_string());
            }
        }

        Ok(())
    }

    fn record_timeout(
        result: &mut MigrationResult,
        step: &MigrationStep,
        running: Option<(usize, DateTime<Utc>, Instant)>,
    ) {
        result.metadata.timed_out = true;
        let message = format!("timeout reached at step {}", step.id);
        if let Some((index, started_at, clock)) = running {
            result.record_step(StepResult {
                step_id: step.id.clone(),
                order_index: index,
                status: StepStatus::Failed,
                started_at,
                duration_ms: clock.elapsed().as_millis() as u64,
                rows_affected: 0,
                error: Some(message.clone()),
                rollback_available: step.rollback_supported,
            });
        }
        warn!(migration_id = %result.migration_id, step_id = %step.id, "Migration timed out");
        let mut err = ExecutionError::new(ErrorCode::Timeout, message);
        err.step_id = Some(step.id.clone());
        result.errors.push(err);
    }

    async fn run_step(
        &self,
        step: &MigrationStep,
        context: &MigrationExecutionContext,
        outer: Option<&mut Box<dyn DatabaseTransaction>>,
    ) -> Result<StepOutcome> {
        if let Some(sql) = step.sql_for(context.database_engine) {
            if sql.trim().is_empty() {
                return Ok(StepOutcome::skipped());
            }
        }
        if context.dry_run {
            return Ok(StepOutcome::noop());
        }

        match outer {
            Some(tx) => self.apply_step(step, context, &mut Target::Tx(tx.as_mut())).await,
            None if step.transactional => {
                let mut tx = self.client.begin().await?;
                let outcome = self
                    .apply_step(step, context, &mut Target::Tx(tx.as_mut()))
                    .await;
                match outcome {
                    Ok(done) => {
                        tx.commit().await?;
                        Ok(done)
                    }
                    Err(err) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(step_id = %step.id, error = %rollback_err, "Rollback after step failure failed");
                        }
                        Err(err)
                    }
                }
            }
            None => {
                self.apply_step(step, context, &mut Target::Client(self.client.as_ref()))
                    .await
            }
        }
    }

    async fn apply_step(
        &self,
        step: &MigrationStep,
        context: &MigrationExecutionContext,
        target: &mut Target<'_>,
    ) -> Result<StepOutcome> {
        let checks = step.validation.as_ref();
        if let Some(check) = checks.and_then(|v| v.pre.as_ref()) {
            Self::check(target, check, "pre", &step.id).await?;
        }

        let mut changes = ChangeSummary::default();
        let rows = match &step.action {
            StepAction::Sql(sql) => {
                let sql = sql.for_engine(context.database_engine);
                let mut total = 0;
                for statement in split_statements(sql) {
                    let affected = target.execute(&statement, &[]).await?;
                    StatementKind::of(&statement).tally(&mut changes, affected);
                    total += affected;
                }
                changes.absorb(&self.adapter.classifier().classify(sql).schema_changes());
                total
            }
            StepAction::Transform(transform) => {
                let inserted = self.run_transform(transform, context, target).await?;
                changes.rows_inserted += inserted;
                inserted
            }
        };

        if let Some(check) = checks.and_then(|v| v.post.as_ref()) {
            Self::check(target, check, "post", &step.id).await?;
        }

        Ok(StepOutcome {
            status: StepStatus::Success,
            rows,
            changes,
        })
    }

    async fn check(
        target: &mut Target<'_>,
        check: &ValidationCheck,
        phase: &str,
        step_id: &str,
    ) -> Result<()> {
        let rows = target.query(&check.query, &[]).await?;
        let satisfied = match &check.expect {
            Expectation::RowsExist => !rows.is_empty(),
            Expectation::NoRows => rows.is_empty(),
            Expectation::ScalarEquals { value } => rows
                .first()
                .and_then(|row| row.values().next())
                .is_some_and(|actual| values_equal(actual, value)),
        };
        if satisfied {
            Ok(())
        } else {
            Err(MigrationError::execution(format!(
                "{phase}-validation of step {step_id} failed: {} returned {} row(s), expected {:?}",
                check.query,
                rows.len(),
                check.expect
            )))
        }
    }

    async fn run_transform(
        &self,
        transform: &DataTransform,
        context: &MigrationExecutionContext,
        target: &mut Target<'_>,
    ) -> Result<u64> {
        let engine = context.database_engine;
        let mapping: Vec<(&str, MappedValue)> = transform
            .mapping
            .iter()
            .map(|m| -> Result<(&str, MappedValue)> {
                let value = match &m.transform {
                    FieldTransform::Direct => {
                        MappedValue::Direct(m.source.clone().unwrap_or_else(|| m.target.clone()))
                    }
                    FieldTransform::Constant { value } => MappedValue::Constant(value.clone()),
                    FieldTransform::Expression { expr } => MappedValue::Expression(Expression::parse(expr)?),
                };
                Ok((m.target.as_str(), value))
            })
            .collect::<Result<_>>()?;
        if mapping.is_empty() {
            return Err(MigrationError::transform(format!(
                "transform {} -> {} has no field mappings",
                transform.source_table, transform.target_table
            )));
        }

        let mut select = format!("SELECT * FROM {}", engine.quote_ident(&transform.source_table));
        let filters: Vec<String> = [transform.filter.as_deref(), context.data_filter.as_deref()]
            .into_iter()
            .flatten()
            .filter(|f| !f.trim().is_empty())
            .map(|f| format!("({f})"))
            .collect();
        if !filters.is_empty() {
            select.push_str(" WHERE ");
            select.push_str(&filters.join(" AND "));
        }
        let rows = target.query(&select, &[]).await?;

        let batch_size = transform
            .batch_size
            .or(context.options.batch_size)
            .unwrap_or(self.config.default_batch_size)
            .max(1);
        let columns = mapping
            .iter()
            .map(|(column, _)| engine.quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let table = engine.quote_ident(&transform.target_table);

        let mut inserted = 0;
        for chunk in rows.chunks(batch_size) {
            let mut params = Vec::with_capacity(chunk.len() * mapping.len());
            let mut tuples = Vec::with_capacity(chunk.len());
            for row in chunk {
                let mut slots = Vec::with_capacity(mapping.len());
                for (column, value) in &mapping {
                    let value = match value {
                        MappedValue::Direct(source) => row.get(source).cloned().ok_or_else(|| {
                            MigrationError::transform(format!(
                                "source column {source} for {column} is missing"
                            ))
                        })?,
                        MappedValue::Constant(value) => value.clone(),
                        MappedValue::Expression(expr) => expr.evaluate(row)?,
                    };
                    params.push(value);
                    slots.push(engine.placeholder(params.len()));
                }
                tuples.push(format!("({})", slots.join(", ")));
            }
            let sql = format!("INSERT INTO {table} ({columns}) VALUES {}", tuples.join(", "));
            inserted += target.execute(&sql, &params).await?;
        }

        debug!(
            source = %transform.source_table,
            target = %transform.target_table,
            rows = rows.len(),
            inserted,
            "Transform applied"
        );
        Ok(inserted)
    }

    async fn persist(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        result: &MigrationResult,
    ) -> Result<()> {
        for step in &result.steps {
            self.log.record_step(execution_id, step).await?;
        }
        self.log.complete_execution(execution_id, status, result).await
    }

    /// Revert a previously applied migration.
    ///
    /// The most recent successful run of `migration_id` must be an `up` run
    /// that reported rollback support. The `down` sequence runs under a fresh
    /// session id derived from `context`.
    pub async fn rollback_migration(
        &self,
        migration_id: &str,
        context: &MigrationExecutionContext,
    ) -> Result<MigrationResult> {
        self.log.ensure_tables().await?;
        let migration = self.catalog.get(migration_id).await?;

        let last = self
            .log
            .last_successful_execution(migration_id)
            .await?
            .filter(|record| record.direction == Direction::Up)
            .ok_or_else(|| MigrationError::NotApplied {
                id: migration_id.to_string(),
            })?;
        if !last.rollback_available {
            return Err(MigrationError::RollbackNotSupported {
                id: migration_id.to_string(),
                reason: format!("execution {} reported no rollback support", last.execution_id),
            });
        }

        info!(migration_id = %migration_id, applied_by = %last.session_id, "Rolling back migration");
        let context = context.fresh_session().direction(Direction::Down);
        self.execute_migration(&migration, &context).await
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    /// Plan the migrations that bring `plugin_id` to `target_version`.
    ///
    /// Candidates are catalogued, unapplied migrations with a version above
    /// the current one and at most the target. Nothing is executed.
    pub async fn create_migration_plan(
        &self,
        plugin_id: &str,
        target_version: &str,
        context: &MigrationExecutionContext,
    ) -> Result<MigrationPlan> {
        self.log.ensure_tables().await?;
        let target = parse_version(target_version)?;
        let applied_records = self.log.applied_migrations(plugin_id).await?;
        let applied: BTreeSet<String> = applied_records
            .iter()
            .map(|a| a.migration_id.clone())
            .collect();

        let installed = match &self.plugins {
            Some(registry) => registry.get_plugin(plugin_id).await?.version,
            None => None,
        };
        let current = match installed {
            Some(version) => Some(parse_version(&version)?),
            None => applied_records
                .iter()
                .filter_map(|a| parse_version(&a.version).ok())
                .max(),
        };

        let mut validation = MigrationValidation::ok();
        let mut candidates = Vec::new();
        for migration in self.catalog.list(plugin_id).await? {
            if applied.contains(&migration.id) {
                continue;
            }
            let Ok(version) = migration.semver() else {
                validation.warn(
                    ValidationIssue::new(
                        "INVALID_VERSION",
                        format!("{} has an unparseable version and was not planned", migration.id),
                    )
                    .in_migration(&migration.id),
                );
                continue;
            };
            let above_current = current.as_ref().map_or(true, |c| &version > c);
            if above_current && version <= target {
                candidates.push(migration);
            }
        }

        let ordered = resolve_with_applied(candidates, &applied)?;

        let mut conflicts = self.resolver.detect_multiple_conflicts(&ordered);
        let mut state = self.applied_state(plugin_id).await?;
        for migration in &ordered {
            conflicts.extend(self.resolver.detect_conflicts(migration, &state, Direction::Up));
            state.mark_applied(&migration.id);
        }

        for migration in &ordered {
            validation.merge(
                self.validator
                    .validate_migration(migration, context.database_engine),
            );
        }
        validation.merge(self.validator.validate_migration_plan(&ordered, &applied));

        let plan = MigrationPlan::from_ordered(
            plugin_id,
            current.map(|v| v.to_string()),
            target_version,
            ordered,
            conflicts,
            validation,
        );
        info!(
            plugin_id = %plugin_id,
            target_version = %target_version,
            migrations = plan.migrations.len(),
            risk = %plan.estimated_risk,
            "Migration plan created"
        );
        Ok(plan)
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Execution records, newest first, optionally for one plugin.
    pub async fn get_migration_status(&self, plugin_id: Option<&str>) -> Result<Vec<ExecutionRecord>> {
        self.log.ensure_tables().await?;
        self.log.status(plugin_id).await
    }

    /// Step records of one execution.
    pub async fn step_history(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        self.log.ensure_tables().await?;
        self.log.step_history(execution_id).await
    }

    // ------------------------------------------------------------------
    // Data transfer
    // ------------------------------------------------------------------

    fn table_prefix(plugin_id: &str) -> String {
        format!("{plugin_id}_")
    }

    /// Dump every table owned by `plugin_id` (named `<plugin_id>_*`).
    pub async fn export_data(&self, plugin_id: &str) -> Result<DataExport> {
        let engine = self.client.engine();
        let mut tables = BTreeMap::new();
        for table in self.client.list_tables(&Self::table_prefix(plugin_id)).await? {
            let rows = self
                .client
                .query(&format!("SELECT * FROM {}", engine.quote_ident(&table)), &[])
                .await?;
            tables.insert(table, rows);
        }
        let export = DataExport::new(plugin_id, tables);
        info!(
            plugin_id = %plugin_id,
            tables = export.tables.len(),
            rows = export.row_count(),
            bytes = export.size,
            "Data exported"
        );
        Ok(export)
    }

    /// Every table in an export must belong to its plugin.
    fn check_ownership(data: &DataExport) -> Result<()> {
        let prefix = Self::table_prefix(&data.plugin_id);
        match data.tables.keys().find(|table| !table.starts_with(&prefix)) {
            Some(table) => Err(MigrationError::InvalidData(format!(
                "table {table} is not owned by plugin {}",
                data.plugin_id
            ))),
            None => Ok(()),
        }
    }

    fn validate_import(import: &DataImport) -> Result<()> {
        let data = &import.data;
        if !data.verify_checksum() {
            return Err(MigrationError::ChecksumMismatch {
                subject: format!("export of {}", data.plugin_id),
                expected: data.checksum.clone(),
                actual: DataExport::compute_checksum(&data.tables),
            });
        }

        for (table, rows) in &data.tables {
            let schema = data.schema.get(table).ok_or_else(|| {
                MigrationError::InvalidData(format!("table {table} has no schema"))
            })?;
            let known: BTreeSet<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
            for (index, row) in rows.iter().enumerate() {
                if let Some(column) = row.keys().find(|k| !known.contains(k.as_str())) {
                    return Err(MigrationError::InvalidData(format!(
                        "record {index} of {table} has column {column} missing from the schema"
                    )));
                }
            }
        }
        Ok(())
    }

    fn insert_sql(
        engine: DatabaseEngine,
        table: &str,
        columns: &[&String],
        primary_key: &[String],
        overwrite: bool,
    ) -> Result<String> {
        let quoted: Vec<String> = columns.iter().map(|c| engine.quote_ident(c)).collect();
        let slots: Vec<String> = (1..=columns.len()).map(|i| engine.placeholder(i)).collect();
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            engine.quote_ident(table),
            quoted.join(", "),
            slots.join(", ")
        );
        if !overwrite || primary_key.is_empty() {
            return Ok(sql);
        }

        let updates: Vec<&String> = columns
            .iter()
            .copied()
            .filter(|c| !primary_key.contains(*c))
            .collect();
        match engine {
            DatabaseEngine::PostgreSQL | DatabaseEngine::SQLite => {
                let keys: Vec<String> = primary_key.iter().map(|k| engine.quote_ident(k)).collect();
                if updates.is_empty() {
                    sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", keys.join(", ")));
                } else {
                    let set: Vec<String> = updates
                        .iter()
                        .map(|c| {
                            let c = engine.quote_ident(c);
                            format!("{c} = EXCLUDED.{c}")
                        })
                        .collect();
                    sql.push_str(&format!(
                        " ON CONFLICT ({}) DO UPDATE SET {}",
                        keys.join(", "),
                        set.join(", ")
                    ));
                }
            }
            DatabaseEngine::MySQL => {
                let set: Vec<String> = if updates.is_empty() {
                    primary_key
                        .iter()
                        .map(|k| {
                            let k = engine.quote_ident(k);
                            format!("{k} = {k}")
                        })
                        .collect()
                } else {
                    updates
                        .iter()
                        .map(|c| {
                            let c = engine.quote_ident(c);
                            format!("{c} = VALUES({c})")
                        })
                        .collect()
                };
                sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", set.join(", ")));
            }
            DatabaseEngine::MSSQL | DatabaseEngine::Oracle => {
                return Err(MigrationError::UnsupportedDatabase(format!(
                    "overwrite import on {engine}"
                )));
            }
        }
        Ok(sql)
    }

    /// Restore exported rows.
    ///
    /// With `skip_errors` every record is written on its own and failures are
    /// collected. Otherwise each batch runs in a transaction and the first
    /// failing record rolls back its batch and stops the import.
    pub async fn import_data(&self, import: &DataImport) -> Result<ImportResult> {
        let started = Instant::now();
        let data = &import.data;
        let options = &import.options;
        Self::check_ownership(data)?;
        if options.validate {
            Self::validate_import(import)?;
        }

        let _lock = self.lock_plugin(&data.plugin_id).await?;
        let engine = self.client.engine();
        let batch_size = options.batch_size.max(1);
        let mut result = ImportResult::default();
        let mut stopped = false;

        'tables: for (table, rows) in &data.tables {
            let primary_key = data
                .schema
                .get(table)
                .map(|s| s.primary_key.clone())
                .unwrap_or_default();
            let mut written = 0;

            for (batch_index, chunk) in rows.chunks(batch_size).enumerate() {
                let base = batch_index * batch_size;
                if options.skip_errors {
                    for (offset, record) in chunk.iter().enumerate() {
                        let columns: Vec<&String> = record.keys().collect();
                        let sql = Self::insert_sql(engine, table, &columns, &primary_key, options.overwrite)?;
                        let params: Vec<Value> = record.values().cloned().collect();
                        match self.client.execute(&sql, &params).await {
                            Ok(_) => written += 1,
                            Err(err) if err.is_infrastructure() => return Err(err),
                            Err(err) => result.errors.push(RecordError {
                                table: table.clone(),
                                record_index: base + offset,
                                message: err.to_string(),
                                record: record.clone(),
                            }),
                        }
                    }
                    continue;
                }

                let mut tx = self.client.begin().await?;
                let mut failure = None;
                for (offset, record) in chunk.iter().enumerate() {
                    let columns: Vec<&String> = record.keys().collect();
                    let sql = Self::insert_sql(engine, table, &columns, &primary_key, options.overwrite)?;
                    let params: Vec<Value> = record.values().cloned().collect();
                    if let Err(err) = tx.execute(&sql, &params).await {
                        failure = Some((base + offset, record, err));
                        break;
                    }
                }
                match failure {
                    None => {
                        tx.commit().await?;
                        written += chunk.len();
                    }
                    Some((record_index, record, err)) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(table = %table, error = %rollback_err, "Import rollback failed");
                        }
                        if err.is_infrastructure() {
                            return Err(err);
                        }
                        result.errors.push(RecordError {
                            table: table.clone(),
                            record_index,
                            message: err.to_string(),
                            record: record.clone(),
                        });
                        result.records_imported += written;
                        if written > 0 {
                            result.tables_imported += 1;
                        }
                        stopped = true;
                        break 'tables;
                    }
                }
            }

            result.records_imported += written;
            if written > 0 {
                result.tables_imported += 1;
            }
        }

        result.records_failed = result.errors.len();
        result.success = result.errors.is_empty() || options.skip_errors;
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            plugin_id = %data.plugin_id,
            imported = result.records_imported,
            failed = result.records_failed,
            stopped,
            "Data imported"
        );
        Ok(result)
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(n), Value::Bool(b)) | (Value::Bool(b), Value::Number(n)) => {
            n.as_i64() == Some(i64::from(*b))
        }
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionOptions, FieldMapping, ImportOptions, RiskLevel};
    use crate::testing::{row, MockDatabase};
    use serde_json::json;
    use std::time::Duration;

    const ENGINE: DatabaseEngine = DatabaseEngine::SQLite;

    fn engine_with(db: &MockDatabase, catalog: InMemoryCatalog) -> (MigrationEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            backup_dir: dir.path().join("backups"),
            lock_timeout: Duration::from_millis(200),
            ..EngineConfig::default()
        };
        let engine = MigrationEngine::builder(config, Arc::new(db.clone()))
            .catalog(Arc::new(catalog))
            .build();
        (engine, dir)
    }

    fn engine(db: &MockDatabase) -> (MigrationEngine, tempfile::TempDir) {
        engine_with(db, InMemoryCatalog::new())
    }

    fn ctx() -> MigrationExecutionContext {
        MigrationExecutionContext::new(ENGINE)
    }

    fn three_steps(skip_on_error: bool) -> PortableMigration {
        let failing = MigrationStep::sql("fail", "INSERT INTO blog_broken (id) VALUES (1)");
        let failing = if skip_on_error { failing.skip_on_error() } else { failing };
        PortableMigration::builder("blog-1.0.0", "blog", "1.0.0")
            .up(MigrationStep::sql("ok1", "INSERT INTO blog_posts (id) VALUES (1)"))
            .up(failing)
            .up(MigrationStep::sql("ok2", "INSERT INTO blog_tags (id) VALUES (1)"))
            .build()
            .unwrap()
    }

    fn log_row(migration_id: &str, direction: &str, rollback: bool) -> Row {
        row(json!({
            "execution_id": format!("exec-{migration_id}"),
            "migration_id": migration_id,
            "plugin_id": "blog",
            "version": "1.0.0",
            "direction": direction,
            "session_id": "earlier",
            "status": "completed",
            "success": true,
            "dry_run": false,
            "rollback_available": rollback,
            "checksum": "x",
            "started_at": "2024-05-01T10:00:00.000000Z",
            "completed_at": "2024-05-01T10:00:01.000000Z",
            "duration_ms": 1000,
            "error": null,
            "initiated_by": null
        }))
    }

    #[tokio::test]
    async fn test_failed_step_stops_the_loop() {
        let db = MockDatabase::new(ENGINE).fail_on("blog_broken");
        let (engine, _dir) = engine(&db);

        let result = engine.execute_migration(&three_steps(false), &ctx()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.successful_steps, 1);
        assert_eq!(result.failed_steps, 1);
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps.iter().all(|s| s.step_id != "ok2"));
        assert!(db.executed_matching("blog_tags").is_empty());
        assert_eq!(result.errors[0].code, ErrorCode::StepFailed);
        assert_eq!(result.errors[0].step_id.as_deref(), Some("fail"));
        assert_eq!(result.changes.rows_inserted, 1);
        assert!(!result.rollback_available);
        assert_eq!(db.executed_matching("ROLLBACK").len(), 1);
        assert_eq!(db.executed_matching("INSERT INTO migration_step_log").len(), 2);
        assert!(engine.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_skip_on_error_continues() {
        let db = MockDatabase::new(ENGINE).fail_on("blog_broken");
        let (engine, _dir) = engine(&db);

        let result = engine.execute_migration(&three_steps(true), &ctx()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.successful_steps, 2);
        assert_eq!(result.failed_steps, 1);
        let ids: Vec<&str> = result.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["ok1", "fail", "ok2"]);
    }

    #[tokio::test]
    async fn test_dry_run_executes_no_sql() {
        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine(&db);
        let migration = PortableMigration::builder("blog-1.0.0", "blog", "1.0.0")
            .up(MigrationStep::sql("create", "CREATE TABLE blog_posts (id INTEGER)"))
            .requires_backup(true)
            .build()
            .unwrap();

        let result = engine
            .execute_migration(&migration, &ctx().dry_run(true))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.metadata.dry_run);
        assert!(!result.backup_created);
        assert!(result.warnings.iter().any(|w| w.contains("dry run")));
        assert!(db.executed_matching("blog_posts").is_empty());
        assert_eq!(db.executed_matching("INSERT INTO migration_execution_log").len(), 1);
        assert_eq!(db.executed_matching("INSERT INTO migration_step_log").len(), 1);
        assert!(engine.catalog().get("blog-1.0.0").await.is_err());
    }

    #[tokio::test]
    async fn test_held_plugin_lock_rejects_run() {
        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine(&db);
        let guard = engine.lock_plugin("blog").await.unwrap();

        let err = engine
            .execute_migration(&three_steps(false), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::LockFailed(_)));
        assert!(err.is_retryable());
        assert!(db.executed_matching("blog_posts").is_empty());
        assert!(engine.active_sessions().is_empty());

        // Other plugins are not blocked.
        engine.lock_plugin("shop").await.unwrap();

        drop(guard);
        let result = engine.execute_migration(&three_steps(false), &ctx()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.successful_steps, 3);
    }

    #[tokio::test]
    async fn test_validation_failure_rejects_before_steps() {
        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine(&db);
        let migration = PortableMigration::builder("blog-1.0.0", "blog", "1.0.0")
            .up(MigrationStep::sql("wipe", "DELETE FROM blog_posts"))
            .build()
            .unwrap();

        let err = engine.execute_migration(&migration, &ctx()).await.unwrap_err();
        assert!(err.is_preflight_rejection());
        assert!(db.executed_matching("DELETE FROM blog_posts").is_empty());
        assert!(db.executed_matching("UPDATE migration_execution_log").is_empty());
        assert!(engine.active_sessions().is_empty());
        assert!(engine.catalog().get("blog-1.0.0").await.is_err());

        let options = ExecutionOptions {
            skip_validation: true,
            ..ExecutionOptions::default()
        };
        let result = engine
            .execute_migration(&migration, &ctx().options(options))
            .await
            .unwrap();
        assert!(result.success);
        assert!(engine.catalog().get("blog-1.0.0").await.is_ok());
        assert_eq!(result.changes.rows_deleted, 1);
    }

    #[tokio::test]
    async fn test_critical_conflict_requires_force() {
        let create = PortableMigration::builder("blog-1.0.0", "blog", "1.0.0")
            .up(MigrationStep::sql("s1", "CREATE TABLE blog_posts (id INTEGER)"))
            .build()
            .unwrap();
        let drop = PortableMigration::builder("blog-2.0.0", "blog", "2.0.0")
            .up(MigrationStep::sql("s1", "DROP TABLE blog_posts"))
            .build()
            .unwrap();
        let db = MockDatabase::new(ENGINE)
            .respond("WHERE plugin_id", vec![log_row("blog-1.0.0", "up", false)]);
        let (engine, _dir) = engine_with(&db, InMemoryCatalog::with_migrations([create]));

        match engine.execute_migration(&drop, &ctx()).await {
            Err(MigrationError::ConflictDetected { conflicts, .. }) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].object_name, "blog_posts");
            }
            other => panic!("expected a conflict, got {other:?}"),
        }

        let result = engine.execute_migration(&drop, &ctx().force(true)).await.unwrap();
        assert!(result.success);
        assert!(result.metadata.forced);
        assert!(result.warnings.iter().any(|w| w.starts_with("conflict:")));
    }

    #[tokio::test]
    async fn test_timeout_stops_the_run() {
        let db = MockDatabase::new(ENGINE).delay_on("blog_slow", Duration::from_millis(500));
        let (engine, _dir) = engine(&db);
        let migration = PortableMigration::builder("blog-1.0.0", "blog", "1.0.0")
            .up(MigrationStep::sql("slow", "UPDATE blog_slow SET x = 1 WHERE id = 1"))
            .up(MigrationStep::sql("after", "UPDATE blog_posts SET x = 1 WHERE id = 1"))
            .build()
            .unwrap();
        let options = ExecutionOptions {
            timeout: Some(Duration::from_millis(50)),
            ..ExecutionOptions::default()
        };

        let result = engine
            .execute_migration(&migration, &ctx().options(options))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.metadata.timed_out);
        assert_eq!(result.errors[0].code, ErrorCode::Timeout);
        assert_eq!(result.steps.len(), 1);
        assert!(db.executed_matching("blog_posts").is_empty());
    }

    #[tokio::test]
    async fn test_atomic_run_uses_one_transaction() {
        let db = MockDatabase::new(ENGINE).fail_on("blog_broken");
        let (engine, _dir) = engine(&db);
        let options = ExecutionOptions {
            atomic: true,
            ..ExecutionOptions::default()
        };

        let result = engine
            .execute_migration(&three_steps(true), &ctx().options(options))
            .await
            .unwrap();

        assert_eq!(result.steps.len(), 3);
        assert_eq!(db.executed_matching("BEGIN").len(), 1);
        assert_eq!(db.executed_matching("ROLLBACK").len(), 1);
        assert!(db.executed_matching("COMMIT").is_empty());
        assert!(result.warnings.iter().any(|w| w.contains("atomic")));
    }

    #[tokio::test]
    async fn test_sessions_are_unique_and_cancellable() {
        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine(&db);
        let migration = three_steps(false);
        let context = ctx();

        let guard = engine.register_session(&migration, &context).unwrap();
        assert!(matches!(
            engine.register_session(&migration, &context),
            Err(MigrationError::DuplicateSession(_))
        ));
        assert_eq!(engine.active_sessions().len(), 1);
        assert!(engine.cancel_session(&context.session_id));
        assert!(guard.cancelled.load(Ordering::SeqCst));
        assert!(engine.active_sessions()[0].cancelled);
        drop(guard);

        assert!(engine.active_sessions().is_empty());
        assert!(!engine.cancel_session(&context.session_id));
    }

    #[tokio::test]
    async fn test_engine_specific_empty_sql_is_skipped() {
        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine(&db);
        let migration = PortableMigration::builder("blog-1.0.0", "blog", "1.0.0")
            .up(MigrationStep::sql("ext", "CREATE EXTENSION IF NOT EXISTS pgcrypto")
                .with_engine_sql(ENGINE, ""))
            .up(MigrationStep::sql("create", "CREATE TABLE blog_posts (id INTEGER)"))
            .build()
            .unwrap();

        let result = engine.execute_migration(&migration, &ctx()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.skipped_steps, 1);
        assert_eq!(result.steps[0].status, StepStatus::Skipped);
        assert_eq!(result.changes.tables_created, 1);
        assert!(db.executed_matching("pgcrypto").is_empty());
    }

    #[tokio::test]
    async fn test_transform_step_inserts_mapped_rows() {
        let db = MockDatabase::new(ENGINE).respond(
            "FROM \"blog_authors\"",
            vec![
                row(json!({"id": 1, "first": "ada", "last": "lovelace"})),
                row(json!({"id": 2, "first": "alan", "last": "turing"})),
            ],
        );
        let (engine, _dir) = engine(&db);
        let migration = PortableMigration::builder("blog-1.1.0", "blog", "1.1.0")
            .up(MigrationStep::transform(
                "copy",
                DataTransform {
                    source_table: "blog_authors".to_string(),
                    target_table: "blog_people".to_string(),
                    mapping: vec![
                        FieldMapping::direct("id", "id"),
                        FieldMapping::expression("name", "upper(first) || ' ' || last"),
                        FieldMapping::constant("active", json!(true)),
                    ],
                    filter: Some("id > 0".to_string()),
                    batch_size: Some(1),
                },
            ))
            .build()
            .unwrap();

        let result = engine
            .execute_migration(&migration, &ctx().data_filter("last IS NOT NULL"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.changes.rows_inserted, 2);
        assert!(db
            .queries()
            .iter()
            .any(|q| q == "SELECT * FROM \"blog_authors\" WHERE (id > 0) AND (last IS NOT NULL)"));
        let inserts = db.executed_matching("INSERT INTO \"blog_people\"");
        assert_eq!(inserts.len(), 2);
        assert_eq!(
            inserts[1],
            "INSERT INTO \"blog_people\" (\"id\", \"name\", \"active\") VALUES ($1, $2, $3)"
        );
    }

    #[tokio::test]
    async fn test_backup_before_risky_run() {
        let db = MockDatabase::new(ENGINE)
            .with_tables(&["blog_posts"])
            .respond("SELECT * FROM \"blog_posts\"", vec![row(json!({"id": 1}))]);
        let (engine, _dir) = engine(&db);
        let migration = PortableMigration::builder("blog-2.0.0", "blog", "2.0.0")
            .up(MigrationStep::sql("s1", "ALTER TABLE blog_posts DROP COLUMN legacy"))
            .requires_backup(true)
            .build()
            .unwrap();

        let result = engine.execute_migration(&migration, &ctx()).await.unwrap();
        assert!(result.backup_created);
        let location = result.backup_location.unwrap();
        assert!(std::path::Path::new(&location).exists());
    }

    #[tokio::test]
    async fn test_rollback_requires_successful_up_run() {
        let migration = PortableMigration::builder("blog-1.0.0", "blog", "1.0.0")
            .up(MigrationStep::sql("s1", "CREATE TABLE blog_posts (id INTEGER)").reversible())
            .down(MigrationStep::sql("s1", "DROP TABLE blog_posts"))
            .build()
            .unwrap();

        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine_with(&db, InMemoryCatalog::with_migrations([migration.clone()]));
        assert!(matches!(
            engine.rollback_migration("blog-1.0.0", &ctx()).await,
            Err(MigrationError::NotApplied { .. })
        ));
        assert!(matches!(
            engine.rollback_migration("ghost", &ctx()).await,
            Err(MigrationError::NotFound { .. })
        ));

        let db = MockDatabase::new(ENGINE)
            .respond("WHERE migration_id", vec![log_row("blog-1.0.0", "up", false)]);
        let (engine, _dir) = engine_with(&db, InMemoryCatalog::with_migrations([migration.clone()]));
        assert!(matches!(
            engine.rollback_migration("blog-1.0.0", &ctx()).await,
            Err(MigrationError::RollbackNotSupported { .. })
        ));

        let db = MockDatabase::new(ENGINE)
            .respond("WHERE migration_id", vec![log_row("blog-1.0.0", "up", true)])
            .respond("WHERE plugin_id", vec![log_row("blog-1.0.0", "up", true)]);
        let (engine, _dir) = engine_with(&db, InMemoryCatalog::with_migrations([migration]));
        let context = ctx();
        let result = engine.rollback_migration("blog-1.0.0", &context).await.unwrap();
        assert!(result.success);
        assert_eq!(result.direction, Direction::Down);
        assert_ne!(result.session_id, context.session_id);
        assert_eq!(db.executed_matching("DROP TABLE blog_posts").len(), 1);
    }

    #[tokio::test]
    async fn test_down_run_without_down_steps_is_rejected() {
        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine(&db);
        let err = engine
            .execute_migration(&three_steps(false), &ctx().direction(Direction::Down))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::RollbackNotSupported { .. }));
    }

    #[tokio::test]
    async fn test_plan_orders_and_aggregates() {
        let m = |id: &str, version: &str, duration: u64, risk: RiskLevel, deps: &[&str]| {
            let mut builder = PortableMigration::builder(id, "blog", version)
                .up(MigrationStep::sql("s1", format!("CREATE TABLE blog_{} (id INTEGER)", id.replace('-', "_"))))
                .estimated_duration(duration)
                .risk_level(risk);
            for dep in deps {
                builder = builder.depends_on(*dep);
            }
            builder.build().unwrap()
        };
        let catalog = InMemoryCatalog::with_migrations([
            m("c", "1.3.0", 30, RiskLevel::Medium, &["b"]),
            m("a", "1.1.0", 10, RiskLevel::Low, &[]),
            m("b", "1.2.0", 20, RiskLevel::High, &["a"]),
            m("d", "2.0.0", 5, RiskLevel::Critical, &[]),
        ]);
        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine_with(&db, catalog);

        let plan = engine.create_migration_plan("blog", "1.3.0", &ctx()).await.unwrap();

        assert_eq!(plan.migration_ids(), vec!["a", "b", "c"]);
        assert_eq!(plan.estimated_duration, 60);
        assert_eq!(plan.estimated_risk, RiskLevel::High);
        assert!(plan.conflicts.is_empty());
        assert!(plan.validation.valid);
        assert!(plan.current_version.is_none());
        assert!(db.executed_matching("CREATE TABLE blog_").is_empty());
    }

    #[tokio::test]
    async fn test_export_only_plugin_tables() {
        let db = MockDatabase::new(ENGINE)
            .with_tables(&["blog_posts", "shop_items"])
            .respond("\"blog_posts\"", vec![row(json!({"id": 1, "title": "hello"}))]);
        let (engine, _dir) = engine(&db);

        let export = engine.export_data("blog").await.unwrap();
        assert_eq!(export.tables.keys().collect::<Vec<_>>(), vec!["blog_posts"]);
        assert!(export.verify_checksum());
        assert_eq!(export.schema["blog_posts"].primary_key, vec!["id"]);
    }

    fn export() -> DataExport {
        let mut tables = BTreeMap::new();
        tables.insert(
            "blog_posts".to_string(),
            vec![row(json!({"id": 1, "title": "a"})), row(json!({"id": 2, "title": "b"}))],
        );
        tables.insert(
            "blog_tags".to_string(),
            vec![row(json!({"id": 1, "name": "rust"})), row(json!({"id": 2, "name": "sql"}))],
        );
        DataExport::new("blog", tables)
    }

    #[tokio::test]
    async fn test_import_stops_at_first_failure() {
        let db = MockDatabase::new(ENGINE).fail_on("blog_tags");
        let (engine, _dir) = engine(&db);

        let result = engine
            .import_data(&DataImport {
                data: export(),
                options: ImportOptions::default(),
            })
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.records_imported, 2);
        assert_eq!(result.tables_imported, 1);
        assert_eq!(result.records_failed, 1);
        assert_eq!(result.errors[0].table, "blog_tags");
        assert_eq!(result.errors[0].record_index, 0);
        assert_eq!(db.executed_matching("ROLLBACK").len(), 1);
        assert_eq!(db.executed_matching("COMMIT").len(), 1);
    }

    #[tokio::test]
    async fn test_import_skip_errors_collects_failures() {
        let db = MockDatabase::new(ENGINE).fail_on("blog_tags");
        let (engine, _dir) = engine(&db);

        let result = engine
            .import_data(&DataImport {
                data: export(),
                options: ImportOptions {
                    skip_errors: true,
                    ..ImportOptions::default()
                },
            })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.records_imported, 2);
        assert_eq!(result.records_failed, 2);
        assert!(db.executed_matching("BEGIN").is_empty());
    }

    #[tokio::test]
    async fn test_import_rejects_bad_payloads() {
        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine(&db);

        let mut tampered = export();
        tampered.checksum = "0".repeat(64);
        let err = engine
            .import_data(&DataImport {
                data: tampered,
                options: ImportOptions::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { .. }));

        let mut tables = BTreeMap::new();
        tables.insert("shop_items".to_string(), vec![row(json!({"id": 1}))]);
        let err = engine
            .import_data(&DataImport {
                data: DataExport::new("blog", tables),
                options: ImportOptions::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidData(_)));
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_import_never_writes_foreign_tables() {
        let db = MockDatabase::new(ENGINE);
        let (engine, _dir) = engine(&db);

        let mut tables = BTreeMap::new();
        tables.insert(
            "migration_execution_log".to_string(),
            vec![row(json!({"execution_id": "forged"}))],
        );
        let err = engine
            .import_data(&DataImport {
                data: DataExport::new("blog", tables),
                options: ImportOptions {
                    validate: false,
                    ..ImportOptions::default()
                },
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::InvalidData(_)));
        assert!(db.executed().is_empty());
    }

    #[test]
    fn test_upsert_sql() {
        let id = "id".to_string();
        let title = "title".to_string();
        let columns = vec![&id, &title];
        let pk = vec!["id".to_string()];

        let sql = MigrationEngine::insert_sql(DatabaseEngine::SQLite, "blog_posts", &columns, &pk, true).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"blog_posts\" (\"id\", \"title\") VALUES ($1, $2) \
             ON CONFLICT (\"id\") DO UPDATE SET \"title\" = EXCLUDED.\"title\""
        );
        let sql = MigrationEngine::insert_sql(DatabaseEngine::MySQL, "blog_posts", &columns, &pk, true).unwrap();
        assert!(sql.ends_with("ON DUPLICATE KEY UPDATE `title` = VALUES(`title`)"));
        assert!(MigrationEngine::insert_sql(DatabaseEngine::Oracle, "blog_posts", &columns, &pk, true).is_err());
        let sql = MigrationEngine::insert_sql(DatabaseEngine::Oracle, "blog_posts", &columns, &pk, false).unwrap();
        assert!(sql.ends_with("VALUES (:1, :2)"));
    }

    #[test]
    fn test_scalar_comparison() {
        assert!(values_equal(&json!(3), &json!(3.0)));
        assert!(values_equal(&json!(1), &json!(true)));
        assert!(values_equal(&json!("42"), &json!(42)));
        assert!(!values_equal(&json!("a"), &json!("b")));
    }
}
