//! Execution tests against SQLite
//!
//! Runs fixtures through the engine and checks both the result reported and
//! the state left in the database and the audit log.

use crate::fixtures::*;
use crate::helpers::*;
use migration_engine::{
    Direction, ErrorCode, ExecutionOptions, ExecutionStatus, MigrationError, StepStatus,
};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_execute_creates_table_and_logs_run() {
    let db = TestDatabase::new().await.unwrap();

    let result = db
        .engine
        .execute_migration(&create_posts(), &db.context())
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.successful_steps, 1);
    assert!(result.rollback_available);
    assert_eq!(result.changes.tables_created, 1);
    assert!(db.has_table("blog_posts").await);

    let history = db.engine.get_migration_status(Some(PLUGIN)).await.unwrap();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(record.migration_id, "blog-1.0.0");
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.success);
    assert!(record.rollback_available);
    assert!(record.completed_at.is_some());

    let steps = db.engine.step_history(&record.execution_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step_id, "create-posts");
    assert_eq!(steps[0].status, StepStatus::Success);
}

#[tokio::test]
async fn test_dry_run_leaves_database_untouched() {
    let db = TestDatabase::new().await.unwrap();
    let context = db.context().dry_run(true);

    let result = db
        .engine
        .execute_migration(&create_posts(), &context)
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.metadata.dry_run);
    assert!(!db.has_table("blog_posts").await);

    let history = db.engine.get_migration_status(Some(PLUGIN)).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].dry_run);

    // A dry run does not count as applied.
    let err = db
        .engine
        .rollback_migration("blog-1.0.0", &db.context())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::NotApplied { .. }));
}

#[tokio::test]
async fn test_failed_step_is_recorded() {
    let db = TestDatabase::new().await.unwrap();

    let result = db
        .engine
        .execute_migration(&broken_migration("blog-9.0.0", "9.0.0"), &db.context())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.successful_steps, 1);
    assert_eq!(result.failed_steps, 1);
    assert_eq!(result.errors[0].code, ErrorCode::StepFailed);
    // Non-atomic: the first step stays committed.
    assert!(db.has_table("blog_drafts").await);

    let history = db.engine.get_migration_status(Some(PLUGIN)).await.unwrap();
    assert!(!history[0].success);
    assert!(history[0].error.is_some());
}

#[tokio::test]
async fn test_atomic_run_rolls_back_every_step() {
    let db = TestDatabase::new().await.unwrap();
    let context = db.context().options(ExecutionOptions {
        atomic: true,
        ..ExecutionOptions::default()
    });

    let result = db
        .engine
        .execute_migration(&broken_migration("blog-9.0.0", "9.0.0"), &context)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(!db.has_table("blog_drafts").await);
    assert!(result.warnings.iter().any(|w| w.contains("rolled back")));
}

#[tokio::test]
async fn test_rollback_runs_down_steps() {
    let db = TestDatabase::new().await.unwrap();
    db.engine
        .execute_migration(&create_posts(), &db.context())
        .await
        .unwrap();

    let result = db
        .engine
        .rollback_migration("blog-1.0.0", &db.context())
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.direction, Direction::Down);
    assert!(!db.has_table("blog_posts").await);

    // The most recent successful run is now a down run.
    let err = db
        .engine
        .rollback_migration("blog-1.0.0", &db.context())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::NotApplied { .. }));

    let history = db.engine.get_migration_status(Some(PLUGIN)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].direction, Direction::Down);
}

#[tokio::test]
async fn test_missing_dependency_is_a_critical_conflict() {
    let db = TestDatabase::new().await.unwrap();

    let err = db
        .engine
        .execute_migration(&seed_posts(), &db.context())
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::ConflictDetected { .. }));
    assert_eq!(db.count("blog_posts").await, -1);
}

#[tokio::test]
async fn test_transform_copies_filtered_rows_after_backup() {
    let db = TestDatabase::new().await.unwrap();
    for migration in [create_posts(), seed_posts()] {
        let result = db
            .engine
            .execute_migration(&migration, &db.context())
            .await
            .unwrap();
        assert!(result.success, "{} failed: {:?}", migration.id, result.errors);
    }

    let result = db
        .engine
        .execute_migration(&archive_posts(), &db.context())
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert!(result.backup_created);
    assert!(result.backup_location.is_some());
    assert!(db.backup_dir().read_dir().unwrap().next().is_some());

    let rows = db
        .engine
        .client()
        .query("SELECT id, headline, source FROM blog_archive", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], serde_json::json!(2));
    assert_eq!(rows[0]["headline"], serde_json::json!("WORLD"));
    assert_eq!(rows[0]["source"], serde_json::json!("import"));
}

#[tokio::test]
async fn test_concurrent_sessions_on_one_plugin_serialize() {
    let db = TestDatabase::new().await.unwrap();
    let engine = &db.engine;
    let first = create_posts();
    let second = broken_migration("blog-9.0.0", "9.0.0");
    let ctx_a = db.context().session_id("deploy-a");
    let ctx_b = db.context().session_id("deploy-b");

    let (a, b) = tokio::join!(
        engine.execute_migration(&first, &ctx_a),
        engine.execute_migration(&second, &ctx_b),
    );

    assert!(a.unwrap().success);
    assert_eq!(b.unwrap().failed_steps, 1);
    assert!(engine.active_sessions().is_empty());

    // The plugin lock spans the whole run, so one run ends before the other starts.
    let mut history = engine.get_migration_status(Some(PLUGIN)).await.unwrap();
    assert_eq!(history.len(), 2);
    history.sort_by_key(|record| record.started_at);
    let first_done = history[0].completed_at.unwrap();
    assert!(first_done <= history[1].started_at, "runs overlapped: {history:?}");
}
