//! Pre-migration snapshots.

use crate::checksum;
use crate::classify::{normalize_ident, SqlClassifier};
use crate::db::{DatabaseClient, Row};
use crate::error::{MigrationError, Result};
use crate::model::{Direction, MigrationExecutionContext, PortableMigration, StepAction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Reference to a created backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// Content-derived identifier.
    pub backup_id: String,
    /// Where the snapshot lives.
    pub location: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Tables captured.
    pub tables: Vec<String>,
    /// Snapshot size in bytes.
    pub size_bytes: u64,
    /// Checksum over the captured rows.
    pub checksum: String,
}

/// Stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    /// Identifier.
    pub backup_id: String,
    /// Migration the backup precedes.
    pub migration_id: String,
    /// Plugin.
    pub plugin_id: String,
    /// Session that created it.
    pub session_id: String,
    /// Direction of the run it precedes.
    pub direction: Direction,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Rows keyed by table.
    pub tables: BTreeMap<String, Vec<Row>>,
    /// Checksum over `tables`.
    pub checksum: String,
}

/// Creates snapshots before risky runs.
#[async_trait]
pub trait BackupManager: Send + Sync {
    /// Snapshot whatever the run is about to touch.
    async fn create_backup(
        &self,
        migration: &PortableMigration,
        context: &MigrationExecutionContext,
    ) -> Result<BackupInfo>;

    /// Load a snapshot by id.
    async fn get_backup(&self, backup_id: &str) -> Result<BackupSnapshot>;
}

/// Writes JSON snapshots of affected tables into a directory.
pub struct FileBackupManager {
    dir: PathBuf,
    client: Arc<dyn DatabaseClient>,
    classifier: Arc<dyn SqlClassifier>,
}

impl FileBackupManager {
    /// Create a manager writing into `dir`.
    pub fn new(
        dir: impl Into<PathBuf>,
        client: Arc<dyn DatabaseClient>,
        classifier: Arc<dyn SqlClassifier>,
    ) -> Self {
        Self {
            dir: dir.into(),
            client,
            classifier,
        }
    }

    /// Tables the selected steps touch: classifier tables plus transform targets.
    #[must_use]
    pub fn affected_tables(&self, migration: &PortableMigration, direction: Direction) -> BTreeSet<String> {
        let steps = migration.steps(direction);
        let mut tables: BTreeSet<String> =
            self.classifier.classify_steps(steps).tables.into_keys().collect();
        for step in steps {
            if let StepAction::Transform(t) = &step.action {
                tables.insert(normalize_ident(&t.target_table));
            }
        }
        tables
    }

    fn path_for(&self, backup_id: &str) -> Result<PathBuf> {
        let invalid = backup_id.is_empty()
            || backup_id.starts_with('.')
            || !backup_id.chars().all(is_file_safe);
        if invalid {
            return Err(MigrationError::Backup(format!("invalid backup id '{backup_id}'")));
        }
        Ok(self.dir.join(format!("{backup_id}.json")))
    }
}

fn is_file_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

impl std::fmt::Debug for FileBackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackupManager")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BackupManager for FileBackupManager {
    async fn create_backup(
        &self,
        migration: &PortableMigration,
        context: &MigrationExecutionContext,
    ) -> Result<BackupInfo> {
        let engine = self.client.engine();
        let mut tables = BTreeMap::new();

        for table in self.affected_tables(migration, context.direction) {
            if !self.client.table_exists(&table).await? {
                continue;
            }
            let rows = self
                .client
                .query(&format!("SELECT * FROM {}", engine.quote_ident(&table)), &[])
                .await
                .map_err(|e| MigrationError::Backup(format!("snapshot of {table} failed: {e}")))?;
            tables.insert(table, rows);
        }

        let content_hash = checksum::canonical_hash(&serde_json::json!({
            "migration": migration.checksum(),
            "session": context.session_id,
            "direction": context.direction,
            "tables": tables,
        }));
        let stem: String = migration
            .id
            .chars()
            .map(|c| if is_file_safe(c) { c } else { '_' })
            .collect();
        let backup_id = format!("{}-{}", stem.trim_start_matches('.'), &content_hash[..16]);
        let snapshot = BackupSnapshot {
            backup_id: backup_id.clone(),
            migration_id: migration.id.clone(),
            plugin_id: migration.plugin_id.clone(),
            session_id: context.session_id.clone(),
            direction: context.direction,
            created_at: Utc::now(),
            checksum: checksum::canonical_hash(&tables),
            tables,
        };

        let body = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&backup_id)?;
        tokio::fs::write(&path, &body).await?;

        tracing::info!(
            migration_id = %migration.id,
            backup_id = %backup_id,
            tables = snapshot.tables.len(),
            bytes = body.len(),
            "Backup created"
        );

        Ok(BackupInfo {
            backup_id,
            location: path.display().to_string(),
            created_at: snapshot.created_at,
            tables: snapshot.tables.keys().cloned().collect(),
            size_bytes: body.len() as u64,
            checksum: snapshot.checksum,
        })
    }

    async fn get_backup(&self, backup_id: &str) -> Result<BackupSnapshot> {
        let path = self.path_for(backup_id)?;
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MigrationError::Backup(format!("backup {backup_id} not found")));
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: BackupSnapshot = serde_json::from_slice(&body)?;
        let actual = checksum::canonical_hash(&snapshot.tables);
        if actual != snapshot.checksum {
            return Err(MigrationError::ChecksumMismatch {
                subject: format!("backup {backup_id}"),
                expected: snapshot.checksum,
                actual,
            });
        }
        Ok(snapshot)
    }
}
