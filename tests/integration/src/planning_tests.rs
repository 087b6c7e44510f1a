//! Planning tests against SQLite

use crate::fixtures::*;
use crate::helpers::*;
use migration_engine::{DirectoryCatalog, EngineConfig, MigrationCatalog, RiskLevel};
use pretty_assertions::assert_eq;

async fn register_all(db: &TestDatabase) {
    // Registered newest first; the plan must still come out in dependency order.
    for migration in [archive_posts(), seed_posts(), create_posts()] {
        db.engine.catalog().register(&migration).await.unwrap();
    }
}

#[tokio::test]
async fn test_plan_from_empty_database() {
    let db = TestDatabase::new().await.unwrap();
    register_all(&db).await;

    let plan = db
        .engine
        .create_migration_plan(PLUGIN, "1.2.0", &db.context())
        .await
        .unwrap();

    assert_eq!(plan.migration_ids(), vec!["blog-1.0.0", "blog-1.1.0", "blog-1.2.0"]);
    assert!(plan.current_version.is_none());
    assert_eq!(plan.estimated_duration, 8);
    assert_eq!(plan.estimated_risk, RiskLevel::Medium);
    assert!(plan.requires_backup);
    assert!(!plan.can_rollback);
    assert!(plan.validation.valid, "errors: {:?}", plan.validation.errors);
}

#[tokio::test]
async fn test_plan_skips_applied_and_respects_target() {
    let db = TestDatabase::new().await.unwrap();
    register_all(&db).await;
    db.engine
        .execute_migration(&create_posts(), &db.context())
        .await
        .unwrap();

    let plan = db
        .engine
        .create_migration_plan(PLUGIN, "1.1.0", &db.context())
        .await
        .unwrap();

    assert_eq!(plan.current_version.as_deref(), Some("1.0.0"));
    assert_eq!(plan.migration_ids(), vec!["blog-1.1.0"]);
    assert!(plan.can_rollback);
    assert!(plan.conflicts.is_empty());
}

#[tokio::test]
async fn test_plan_at_current_version_is_empty() {
    let db = TestDatabase::new().await.unwrap();
    register_all(&db).await;
    db.engine
        .execute_migration(&create_posts(), &db.context())
        .await
        .unwrap();

    let plan = db
        .engine
        .create_migration_plan(PLUGIN, "1.0.0", &db.context())
        .await
        .unwrap();

    assert!(plan.is_empty());
    assert!(plan.validation.valid);
}

#[tokio::test]
async fn test_plan_reads_directory_catalog() {
    let catalog_dir = tempfile::tempdir().unwrap();
    let seeded = DirectoryCatalog::new(catalog_dir.path());
    for migration in [create_posts(), seed_posts()] {
        seeded.register(&migration).await.unwrap();
    }

    let dir = catalog_dir.path().to_path_buf();
    let db = TestDatabase::with_config(move |config| EngineConfig {
        catalog_dir: Some(dir),
        ..config
    })
    .await
    .unwrap();

    let plan = db
        .engine
        .create_migration_plan(PLUGIN, "2.0.0", &db.context())
        .await
        .unwrap();
    assert_eq!(plan.migration_ids(), vec!["blog-1.0.0", "blog-1.1.0"]);

    // Rollback loads the definition back from the same catalog.
    db.engine
        .execute_migration(&create_posts(), &db.context())
        .await
        .unwrap();
    let result = db
        .engine
        .rollback_migration("blog-1.0.0", &db.context())
        .await
        .unwrap();
    assert!(result.success);
}
