//! Migration definitions known to the engine.
//!
//! A migration is immutable once registered: registering the same id again
//! must carry identical content, otherwise the catalog reports a checksum
//! mismatch. Rollbacks load the original definition from here.

use crate::adapter::FormatAdapter;
use crate::error::{MigrationError, Result};
use crate::model::PortableMigration;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Storage for migration definitions.
#[async_trait]
pub trait MigrationCatalog: Send + Sync {
    /// Store a migration. Idempotent for identical content.
    async fn register(&self, migration: &PortableMigration) -> Result<()>;

    /// Load a migration by id.
    async fn get(&self, id: &str) -> Result<PortableMigration>;

    /// Every migration of a plugin, ordered by version then id.
    async fn list(&self, plugin_id: &str) -> Result<Vec<PortableMigration>>;
}

fn check_immutable(existing: &PortableMigration, incoming: &PortableMigration) -> Result<()> {
    let expected = existing.checksum();
    let actual = incoming.checksum();
    if expected == actual {
        Ok(())
    } else {
        Err(MigrationError::ChecksumMismatch {
            subject: format!("migration {}", incoming.id),
            expected,
            actual,
        })
    }
}

fn sort_by_version(migrations: &mut [PortableMigration]) {
    migrations.sort_by(|a, b| match (a.semver(), b.semver()) {
        (Ok(va), Ok(vb)) => va.cmp(&vb).then_with(|| a.id.cmp(&b.id)),
        _ => a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)),
    });
}

/// Process-local catalog.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    migrations: RwLock<BTreeMap<String, PortableMigration>>,
}

impl InMemoryCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-filled with `migrations`.
    pub fn with_migrations(migrations: impl IntoIterator<Item = PortableMigration>) -> Self {
        let map = migrations.into_iter().map(|m| (m.id.clone(), m)).collect();
        Self {
            migrations: RwLock::new(map),
        }
    }

    /// Number of stored migrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.migrations.read().len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.read().is_empty()
    }
}

#[async_trait]
impl MigrationCatalog for InMemoryCatalog {
    async fn register(&self, migration: &PortableMigration) -> Result<()> {
        let mut migrations = self.migrations.write();
        if let Some(existing) = migrations.get(&migration.id) {
            return check_immutable(existing, migration);
        }
        migrations.insert(migration.id.clone(), migration.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<PortableMigration> {
        self.migrations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| MigrationError::NotFound { id: id.to_string() })
    }

    async fn list(&self, plugin_id: &str) -> Result<Vec<PortableMigration>> {
        let mut out: Vec<PortableMigration> = self
            .migrations
            .read()
            .values()
            .filter(|m| m.plugin_id == plugin_id)
            .cloned()
            .collect();
        sort_by_version(&mut out);
        Ok(out)
    }
}

/// Catalog backed by envelope files at `<dir>/<plugin>/<id>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dir: PathBuf,
    adapter: FormatAdapter,
}

impl DirectoryCatalog {
    /// Catalog rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            adapter: FormatAdapter::default(),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn safe_component<'a>(kind: &str, value: &'a str) -> Result<&'a str> {
        let invalid = value.is_empty()
            || value.starts_with('.')
            || value.contains(['/', '\\', '\0']);
        if invalid {
            return Err(MigrationError::InvalidMigration(format!(
                "{kind} '{value}' cannot be used as a file name"
            )));
        }
        Ok(value)
    }

    fn path_for(&self, plugin_id: &str, id: &str) -> Result<PathBuf> {
        let plugin = Self::safe_component("plugin id", plugin_id)?;
        let id = Self::safe_component("migration id", id)?;
        Ok(self.dir.join(plugin).join(format!("{id}.json")))
    }

    async fn read(&self, path: &Path) -> Result<PortableMigration> {
        let json = tokio::fs::read_to_string(path).await?;
        self.adapter.from_json(&json)
    }

    async fn plugin_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

#[async_trait]
impl MigrationCatalog for DirectoryCatalog {
    async fn register(&self, migration: &PortableMigration) -> Result<()> {
        let path = self.path_for(&migration.plugin_id, &migration.id)?;
        if tokio::fs::try_exists(&path).await? {
            let existing = self.read(&path).await?;
            return check_immutable(&existing, migration);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, self.adapter.to_json(migration)?).await?;
        tracing::debug!(migration_id = %migration.id, path = %path.display(), "Migration registered");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<PortableMigration> {
        let id = Self::safe_component("migration id", id)?;
        for dir in self.plugin_dirs().await? {
            let path = dir.join(format!("{id}.json"));
            if tokio::fs::try_exists(&path).await? {
                return self.read(&path).await;
            }
        }
        Err(MigrationError::NotFound { id: id.to_string() })
    }

    async fn list(&self, plugin_id: &str) -> Result<Vec<PortableMigration>> {
        let dir = self.dir.join(Self::safe_component("plugin id", plugin_id)?);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(self.read(&path).await?);
            }
        }
        sort_by_version(&mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MigrationStep;

    fn migration(id: &str, version: &str, sql: &str) -> PortableMigration {
        PortableMigration::builder(id, "blog", version)
            .up(MigrationStep::sql("s1", sql))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_register_and_list() {
        let catalog = InMemoryCatalog::new();
        catalog.register(&migration("b", "1.10.0", "SELECT 2")).await.unwrap();
        catalog.register(&migration("a", "1.2.0", "SELECT 1")).await.unwrap();
        catalog.register(&migration("a", "1.2.0", "SELECT 1")).await.unwrap();

        assert_eq!(catalog.len(), 2);
        let ids: Vec<String> = catalog.list("blog").await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(catalog.list("shop").await.unwrap().is_empty());
        assert!(matches!(
            catalog.get("missing").await,
            Err(MigrationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_rejects_changed_content() {
        let catalog = InMemoryCatalog::new();
        catalog.register(&migration("a", "1.0.0", "SELECT 1")).await.unwrap();
        let err = catalog
            .register(&migration("a", "1.0.0", "SELECT 2"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_directory_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DirectoryCatalog::new(dir.path().join("catalog"));
        assert!(catalog.list("blog").await.unwrap().is_empty());

        let m = migration("blog-1.0.0", "1.0.0", "CREATE TABLE blog_posts (id INT)");
        catalog.register(&m).await.unwrap();
        catalog.register(&m).await.unwrap();
        assert!(dir.path().join("catalog/blog/blog-1.0.0.json").exists());

        let loaded = catalog.get("blog-1.0.0").await.unwrap();
        assert_eq!(loaded.checksum(), m.checksum());
        assert_eq!(catalog.list("blog").await.unwrap().len(), 1);

        let changed = migration("blog-1.0.0", "1.0.0", "DROP TABLE blog_posts");
        assert!(matches!(
            catalog.register(&changed).await,
            Err(MigrationError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            catalog.get("../etc").await,
            Err(MigrationError::InvalidMigration(_))
        ));
    }
}
