//! Format adapter: legacy conversion, dialect rewriting, transport envelope,
//! SQL file rendering and pairwise conflict detection.

use crate::classify::{pattern, HeuristicClassifier, SqlClassifier};
use crate::config::DatabaseEngine;
use crate::error::{MigrationError, Result};
use crate::model::{
    ConflictSeverity, ConflictType, DataTransform, Direction, FieldTransform, MigrationConflict,
    MigrationStep, PortableMigration, StepAction, StepSql,
};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;

/// Transport format tag.
pub const ENVELOPE_FORMAT: &str = "portable-migration-v1";

/// Transport envelope version.
pub const ENVELOPE_VERSION: &str = "1.0.0";

/// Versioned JSON wrapper around a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEnvelope {
    /// Must equal [`ENVELOPE_FORMAT`].
    pub format: String,
    /// Envelope version.
    pub version: String,
    /// The migration.
    pub migration: PortableMigration,
}

/// A legacy single-SQL-string migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMigration {
    /// Explicit id; derived from plugin, version and name when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Name.
    pub name: String,
    /// Version.
    pub version: String,
    /// Apply SQL.
    pub up: String,
    /// Revert SQL.
    #[serde(default)]
    pub down: Option<String>,
    /// Migration dependencies.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
}

type Rewrites = Vec<(Regex, &'static str)>;

const UUID_FUNCTIONS: &str = r"(?i)\b(uuid_generate_v4|gen_random_uuid)\s*\(\s*\)";
const TIMESTAMPTZ: &str = r"(?i)\bTIMESTAMP\s+WITH\s+TIME\s+ZONE\b|\bTIMESTAMPTZ\b";
const NOW: &str = r"(?i)\bNOW\s*\(\s*\)";

// Order matters: types are rewritten before functions whose replacement
// would otherwise be caught by a later type pattern.
static MYSQL_REWRITES: Lazy<Rewrites> = Lazy::new(|| {
    vec![
        (pattern(TIMESTAMPTZ), "DATETIME"),
        (pattern(r"(?i)\bUUID\b"), "CHAR(36)"),
        (pattern(UUID_FUNCTIONS), "(UUID())"),
        (pattern(r"(?i)\bJSONB\b"), "JSON"),
        (pattern(r"(?i)\bBOOLEAN\b"), "TINYINT(1)"),
        (pattern(r"(?i)\bBIGSERIAL\b"), "BIGINT AUTO_INCREMENT"),
        (pattern(r"(?i)\bSERIAL\b"), "INT AUTO_INCREMENT"),
        (pattern(NOW), "CURRENT_TIMESTAMP"),
    ]
});

static SQLITE_REWRITES: Lazy<Rewrites> = Lazy::new(|| {
    vec![
        (pattern(TIMESTAMPTZ), "DATETIME"),
        (
            pattern(r"(?i)\b(BIG)?SERIAL\s+PRIMARY\s+KEY\b"),
            "INTEGER PRIMARY KEY AUTOINCREMENT",
        ),
        (pattern(r"(?i)\b(BIG)?SERIAL\b"), "INTEGER"),
        (pattern(UUID_FUNCTIONS), "(lower(hex(randomblob(16))))"),
        (pattern(r"(?i)\bUUID\b"), "TEXT"),
        (pattern(r"(?i)\bJSONB?\b"), "TEXT"),
        (pattern(r"(?i)\bBOOLEAN\b"), "INTEGER"),
        (pattern(NOW), "CURRENT_TIMESTAMP"),
    ]
});

static MSSQL_REWRITES: Lazy<Rewrites> = Lazy::new(|| {
    vec![
        (pattern(TIMESTAMPTZ), "DATETIMEOFFSET"),
        (pattern(UUID_FUNCTIONS), "NEWID()"),
        (pattern(r"(?i)\bUUID\b"), "UNIQUEIDENTIFIER"),
        (pattern(r"(?i)\bJSONB?\b"), "NVARCHAR(MAX)"),
        (pattern(r"(?i)\bBOOLEAN\b"), "BIT"),
        (pattern(r"(?i)\bBIGSERIAL\b"), "BIGINT IDENTITY(1,1)"),
        (pattern(r"(?i)\bSERIAL\b"), "INT IDENTITY(1,1)"),
        (pattern(NOW), "SYSDATETIMEOFFSET()"),
    ]
});

static ORACLE_REWRITES: Lazy<Rewrites> = Lazy::new(|| {
    vec![
        (pattern(r"(?i)\bTIMESTAMPTZ\b"), "TIMESTAMP WITH TIME ZONE"),
        (pattern(UUID_FUNCTIONS), "SYS_GUID()"),
        (pattern(r"(?i)\bUUID\b"), "RAW(16)"),
        (pattern(r"(?i)\bJSONB?\b"), "CLOB"),
        (pattern(r"(?i)\bBOOLEAN\b"), "NUMBER(1)"),
        (
            pattern(r"(?i)\b(BIG)?SERIAL\b"),
            "NUMBER GENERATED ALWAYS AS IDENTITY",
        ),
        (pattern(NOW), "SYSTIMESTAMP"),
    ]
});

static NON_SLUG: Lazy<Regex> = Lazy::new(|| pattern(r"[^a-z0-9]+"));

/// Rewrite canonical PostgreSQL SQL for `engine`.
///
/// PostgreSQL input is returned unchanged.
#[must_use]
pub fn adapt_sql_engine(sql: &str, engine: DatabaseEngine) -> String {
    let rewrites: &Rewrites = match engine {
        DatabaseEngine::PostgreSQL => return sql.to_string(),
        DatabaseEngine::MySQL => &MYSQL_REWRITES,
        DatabaseEngine::SQLite => &SQLITE_REWRITES,
        DatabaseEngine::MSSQL => &MSSQL_REWRITES,
        DatabaseEngine::Oracle => &ORACLE_REWRITES,
    };
    rewrites
        .iter()
        .fold(sql.to_string(), |acc, (re, replacement)| {
            re.replace_all(&acc, *replacement).into_owned()
        })
}

/// Build per-engine step SQL. `universal` is kept verbatim; every non-PostgreSQL
/// engine in `engines` (all engines when empty) gets a rewritten variant.
#[must_use]
pub fn adapt_step_sql(universal: &str, engines: &[DatabaseEngine]) -> StepSql {
    let targets: &[DatabaseEngine] = if engines.is_empty() {
        &DatabaseEngine::ALL
    } else {
        engines
    };
    targets
        .iter()
        .filter(|e| **e != DatabaseEngine::PostgreSQL)
        .fold(StepSql::universal(universal), |sql, engine| {
            let adapted = adapt_sql_engine(universal, *engine);
            sql.with_engine(*engine, adapted)
        })
}

fn slugify(name: &str) -> String {
    NON_SLUG
        .replace_all(&name.to_ascii_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// SQL literal for a JSON constant.
#[must_use]
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// `INSERT ... SELECT` equivalent of a transform, if it has no expression mappings.
#[must_use]
pub fn transform_as_sql(transform: &DataTransform) -> Option<String> {
    let mut targets = Vec::with_capacity(transform.mapping.len());
    let mut sources = Vec::with_capacity(transform.mapping.len());
    for mapping in &transform.mapping {
        let source = match &mapping.transform {
            FieldTransform::Direct => mapping.source.clone()?,
            FieldTransform::Constant { value } => sql_literal(value),
            FieldTransform::Expression { .. } => return None,
        };
        targets.push(mapping.target.clone());
        sources.push(source);
    }
    let mut sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        transform.target_table,
        targets.join(", "),
        sources.join(", "),
        transform.source_table
    );
    if let Some(filter) = &transform.filter {
        let _ = write!(sql, " WHERE {filter}");
    }
    Some(sql)
}

/// Converts, serializes, renders and compares portable migrations.
#[derive(Debug, Clone)]
pub struct FormatAdapter {
    classifier: Arc<dyn SqlClassifier>,
}

impl Default for FormatAdapter {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicClassifier::new()))
    }
}

impl FormatAdapter {
    /// Create an adapter around a classifier.
    #[must_use]
    pub fn new(classifier: Arc<dyn SqlClassifier>) -> Self {
        Self { classifier }
    }

    /// The classifier in use.
    #[must_use]
    pub fn classifier(&self) -> &Arc<dyn SqlClassifier> {
        &self.classifier
    }

    /// Wrap a legacy migration into the step model.
    ///
    /// Type, risk and backup requirement are inferred from the up SQL. The
    /// down step is reversible input only when non-empty.
    pub fn to_portable(
        &self,
        raw: RawMigration,
        plugin_id: &str,
        engines: &[DatabaseEngine],
    ) -> Result<PortableMigration> {
        if raw.up.trim().is_empty() {
            return Err(MigrationError::InvalidMigration(format!(
                "{} has no up SQL",
                raw.name
            )));
        }

        let id = raw
            .id
            .clone()
            .unwrap_or_else(|| format!("{plugin_id}-{}-{}", raw.version, slugify(&raw.name)));
        let classification = self.classifier.classify(&raw.up);
        let down = raw.down.as_deref().map(str::trim).filter(|d| !d.is_empty());

        let up_step = MigrationStep {
            description: format!("Apply {}", raw.name),
            rollback_supported: down.is_some(),
            action: StepAction::Sql(adapt_step_sql(&raw.up, engines)),
            ..MigrationStep::sql(format!("{id}-up"), "")
        };

        let mut builder = PortableMigration::builder(&id, plugin_id, &raw.version)
            .name(&raw.name)
            .description(raw.description.clone().unwrap_or_default())
            .migration_type(classification.migration_type)
            .risk_level(classification.risk_level)
            .requires_backup(classification.destructive)
            .engines(engines.iter().copied())
            .estimated_duration(crate::classify::split_statements(&raw.up).len() as u64)
            .up(up_step);

        for dependency in raw.dependencies {
            builder = builder.depends_on(dependency);
        }

        if let Some(down) = down {
            builder = builder.down(MigrationStep {
                description: format!("Revert {}", raw.name),
                action: StepAction::Sql(adapt_step_sql(down, engines)),
                ..MigrationStep::sql(format!("{id}-down"), "")
            });
        }

        let migration = builder.build()?;
        tracing::debug!(
            migration_id = %migration.id,
            plugin_id = %migration.plugin_id,
            migration_type = %migration.migration_type,
            risk = %migration.risk_level,
            "Converted legacy migration"
        );
        Ok(migration)
    }

    /// Serialize into the versioned envelope.
    pub fn to_json(&self, migration: &PortableMigration) -> Result<String> {
        let envelope = MigrationEnvelope {
            format: ENVELOPE_FORMAT.to_string(),
            version: ENVELOPE_VERSION.to_string(),
            migration: migration.clone(),
        };
        Ok(serde_json::to_string_pretty(&envelope)?)
    }

    /// Parse an envelope. Any format tag other than [`ENVELOPE_FORMAT`] fails.
    pub fn from_json(&self, json: &str) -> Result<PortableMigration> {
        let value: Value = serde_json::from_str(json)?;
        match value.get("format").and_then(Value::as_str) {
            Some(ENVELOPE_FORMAT) => {}
            Some(other) => return Err(MigrationError::UnsupportedFormat(other.to_string())),
            None => return Err(MigrationError::UnsupportedFormat("<missing>".to_string())),
        }
        let envelope: MigrationEnvelope = serde_json::from_value(value)?;
        Ok(envelope.migration)
    }

    /// Render a standalone `.sql` file for one engine and direction.
    ///
    /// The `BEGIN;`/`COMMIT;` wrapper is emitted only when every selected step
    /// is transactional.
    #[must_use]
    pub fn to_sql_file(
        &self,
        migration: &PortableMigration,
        engine: DatabaseEngine,
        direction: Direction,
    ) -> String {
        let steps = migration.steps(direction);
        let wrap = !steps.is_empty() && steps.iter().all(|s| s.transactional);
        let mut out = String::new();

        let _ = writeln!(out, "-- Migration: {}", migration.name);
        let _ = writeln!(out, "-- Plugin: {}", migration.plugin_id);
        let _ = writeln!(out, "-- Version: {}", migration.version);
        let _ = writeln!(out, "-- Direction: {direction}");
        let _ = writeln!(out, "-- Engine: {engine}");
        let _ = writeln!(out, "-- Generated: {}", Utc::now().to_rfc3339());
        out.push('\n');

        if wrap {
            out.push_str("BEGIN;\n\n");
        }

        for (i, step) in steps.iter().enumerate() {
            let _ = writeln!(out, "-- Step {}: {}", i + 1, step.id);
            if !step.description.is_empty() {
                let _ = writeln!(out, "-- {}", step.description);
            }
            let body = match &step.action {
                StepAction::Sql(sql) => Some(sql.for_engine(engine).trim().to_string()),
                StepAction::Transform(t) => transform_as_sql(t),
            };
            match body {
                Some(sql) if !sql.is_empty() => {
                    out.push_str(&sql);
                    if !sql.ends_with(';') {
                        out.push(';');
                    }
                    out.push('\n');
                }
                Some(_) => {
                    let _ = writeln!(out, "-- (not applicable to {engine})");
                }
                None => {
                    let _ = writeln!(
                        out,
                        "-- transform {} -> {} uses expression mappings; run it through the engine",
                        step_transform_source(step),
                        step_transform_target(step)
                    );
                }
            }
            out.push('\n');
        }

        if wrap {
            out.push_str("COMMIT;\n");
        }
        out
    }

    /// Pairwise table/index conflicts between the up sequences of two migrations.
    ///
    /// Objects named by both with different operations are reported, sorted by
    /// object name.
    #[must_use]
    pub fn detect_conflicts(
        &self,
        a: &PortableMigration,
        b: &PortableMigration,
    ) -> Vec<MigrationConflict> {
        let left = self.classifier.classify_steps(&a.up);
        let right = self.classifier.classify_steps(&b.up);
        let mut conflicts = Vec::new();

        for (table, op_a) in &left.tables {
            let Some(op_b) = right.tables.get(table) else {
                continue;
            };
            if op_a == op_b {
                continue;
            }
            let severity = if op_a.is_destructive() || op_b.is_destructive() {
                ConflictSeverity::Critical
            } else {
                ConflictSeverity::High
            };
            conflicts.push(MigrationConflict {
                conflict_type: ConflictType::Table,
                migration_a: a.id.clone(),
                migration_b: b.id.clone(),
                object_name: table.clone(),
                description: format!(
                    "{} runs {op_a} TABLE and {} runs {op_b} TABLE on '{table}'",
                    a.id, b.id
                ),
                severity,
                auto_resolvable: false,
            });
        }

        for (index, op_a) in &left.indexes {
            let Some(op_b) = right.indexes.get(index) else {
                continue;
            };
            if op_a == op_b {
                continue;
            }
            conflicts.push(MigrationConflict {
                conflict_type: ConflictType::Index,
                migration_a: a.id.clone(),
                migration_b: b.id.clone(),
                object_name: index.clone(),
                description: format!(
                    "{} runs {op_a} INDEX and {} runs {op_b} INDEX on '{index}'",
                    a.id, b.id
                ),
                severity: ConflictSeverity::Medium,
                auto_resolvable: true,
            });
        }

        conflicts
    }
}

fn step_transform_source(step: &MigrationStep) -> &str {
    match &step.action {
        StepAction::Transform(t) => &t.source_table,
        StepAction::Sql(_) => "",
    }
}

fn step_transform_target(step: &MigrationStep) -> &str {
    match &step.action {
        StepAction::Transform(t) => &t.target_table,
        StepAction::Sql(_) => "",
    }
}
