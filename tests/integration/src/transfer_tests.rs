//! Export and import tests against SQLite

use crate::fixtures::*;
use crate::helpers::*;
use migration_engine::{DataExport, DataImport, ImportOptions, MigrationError};
use pretty_assertions::assert_eq;
use serde_json::json;

/// Database with `blog_posts` and `blog_tags` created and seeded.
async fn seeded() -> TestDatabase {
    let db = TestDatabase::new().await.unwrap();
    for migration in [create_posts(), seed_posts()] {
        let result = db
            .engine
            .execute_migration(&migration, &db.context())
            .await
            .unwrap();
        assert!(result.success, "{} failed: {:?}", migration.id, result.errors);
    }
    db
}

/// Database with the blog schema but no rows.
async fn empty_schema() -> TestDatabase {
    let db = TestDatabase::new().await.unwrap();
    db.engine
        .execute_migration(&create_posts(), &db.context())
        .await
        .unwrap();
    db.execute("CREATE TABLE blog_tags (id INTEGER PRIMARY KEY, post_id INTEGER, label TEXT)")
        .await;
    db
}

#[tokio::test]
async fn test_export_covers_only_plugin_tables() {
    let db = seeded().await;
    db.execute("CREATE TABLE shop_orders (id INTEGER PRIMARY KEY)").await;

    let export = db.engine.export_data(PLUGIN).await.unwrap();

    let tables: Vec<&str> = export.tables.keys().map(String::as_str).collect();
    assert_eq!(tables, vec!["blog_posts", "blog_tags"]);
    assert_eq!(export.row_count(), 2);
    assert!(export.verify_checksum());
    assert_eq!(export.schema["blog_posts"].primary_key, vec!["id".to_string()]);
}

#[tokio::test]
async fn test_export_import_into_second_database() {
    let source = seeded().await;
    let export = source.engine.export_data(PLUGIN).await.unwrap();

    // Through JSON, the way the CLI moves exports between hosts.
    let export: DataExport = serde_json::from_str(&serde_json::to_string(&export).unwrap()).unwrap();

    let target = empty_schema().await;
    let result = target
        .engine
        .import_data(&DataImport {
            data: export,
            options: ImportOptions::default(),
        })
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.records_imported, 2);
    assert_eq!(result.tables_imported, 1);
    assert_eq!(target.count("blog_posts").await, 2);
}

#[tokio::test]
async fn test_import_duplicate_keys_stop_without_overwrite() {
    let db = seeded().await;
    let export = db.engine.export_data(PLUGIN).await.unwrap();

    let result = db
        .engine
        .import_data(&DataImport {
            data: export,
            options: ImportOptions::default(),
        })
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.records_failed, 1);
    assert_eq!(result.records_imported, 0);
    assert_eq!(result.errors[0].table, "blog_posts");
    assert_eq!(result.errors[0].record_index, 0);
}

#[tokio::test]
async fn test_import_overwrite_upserts_rows() {
    let db = seeded().await;
    let mut export = db.engine.export_data(PLUGIN).await.unwrap();
    export.tables.get_mut("blog_posts").unwrap()[0].insert("title".to_string(), json!("edited"));
    let export = DataExport::new(PLUGIN, export.tables);

    let result = db
        .engine
        .import_data(&DataImport {
            data: export,
            options: ImportOptions {
                overwrite: true,
                ..ImportOptions::default()
            },
        })
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(db.count("blog_posts").await, 2);
    let row = db
        .engine
        .client()
        .query_one("SELECT title FROM blog_posts WHERE id = 1", &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["title"], json!("edited"));
}

#[tokio::test]
async fn test_import_skip_errors_keeps_good_records() {
    let db = seeded().await;
    let mut export = db.engine.export_data(PLUGIN).await.unwrap();
    let posts = export.tables.get_mut("blog_posts").unwrap();
    let mut fresh = posts[0].clone();
    fresh.insert("id".to_string(), json!(3));
    posts.push(fresh);
    let export = DataExport::new(PLUGIN, export.tables);

    let result = db
        .engine
        .import_data(&DataImport {
            data: export,
            options: ImportOptions {
                skip_errors: true,
                ..ImportOptions::default()
            },
        })
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.records_imported, 1);
    assert_eq!(result.records_failed, 2);
    assert_eq!(db.count("blog_posts").await, 3);
}

#[tokio::test]
async fn test_tampered_export_is_rejected() {
    let db = seeded().await;
    let mut export = db.engine.export_data(PLUGIN).await.unwrap();
    export.tables.get_mut("blog_posts").unwrap().clear();

    let err = db
        .engine
        .import_data(&DataImport {
            data: export,
            options: ImportOptions::default(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::ChecksumMismatch { .. }));
    assert_eq!(db.count("blog_posts").await, 2);
}
