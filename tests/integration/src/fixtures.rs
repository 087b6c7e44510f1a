//! Test fixtures: a small blog plugin with three versions

use migration_engine::{
    DataTransform, DatabaseEngine, Expectation, FieldMapping, MigrationStep, PortableMigration,
    RiskLevel,
};
use serde_json::json;

/// Plugin id shared by every fixture.
pub const PLUGIN: &str = "blog";

/// 1.0.0: creates `blog_posts`, reversible.
pub fn create_posts() -> PortableMigration {
    PortableMigration::builder("blog-1.0.0", PLUGIN, "1.0.0")
        .name("create posts")
        .engines([DatabaseEngine::PostgreSQL, DatabaseEngine::SQLite])
        .up(
            MigrationStep::sql(
                "create-posts",
                "CREATE TABLE blog_posts (id INTEGER PRIMARY KEY, title TEXT NOT NULL, status TEXT)",
            )
            .reversible()
            .post_check(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'blog_posts'",
                Expectation::RowsExist,
            ),
        )
        .down(MigrationStep::sql("drop-posts", "DROP TABLE blog_posts"))
        .estimated_duration(1)
        .build()
        .expect("valid fixture")
}

/// 1.1.0: seeds two posts and adds `blog_tags`. Depends on 1.0.0.
pub fn seed_posts() -> PortableMigration {
    PortableMigration::builder("blog-1.1.0", PLUGIN, "1.1.0")
        .name("seed posts")
        .depends_on("blog-1.0.0")
        .engines([DatabaseEngine::PostgreSQL, DatabaseEngine::SQLite])
        .up(MigrationStep::sql(
            "insert-posts",
            "INSERT INTO blog_posts (id, title, status) VALUES (1, 'hello', 'draft'); \
             INSERT INTO blog_posts (id, title, status) VALUES (2, 'world', 'published')",
        )
        .reversible())
        .up(MigrationStep::sql(
            "create-tags",
            "CREATE TABLE blog_tags (id INTEGER PRIMARY KEY, post_id INTEGER, label TEXT)",
        )
        .reversible())
        .down(MigrationStep::sql("drop-tags", "DROP TABLE blog_tags"))
        .down(MigrationStep::sql("delete-posts", "DELETE FROM blog_posts WHERE id IN (1, 2)"))
        .estimated_duration(2)
        .build()
        .expect("valid fixture")
}

/// 1.2.0: archives published posts through a row transform. Depends on 1.1.0.
pub fn archive_posts() -> PortableMigration {
    PortableMigration::builder("blog-1.2.0", PLUGIN, "1.2.0")
        .name("archive posts")
        .depends_on("blog-1.1.0")
        .risk_level(RiskLevel::Medium)
        .requires_backup(true)
        .engines([DatabaseEngine::PostgreSQL, DatabaseEngine::SQLite])
        .up(MigrationStep::sql(
            "create-archive",
            "CREATE TABLE blog_archive (id INTEGER PRIMARY KEY, headline TEXT, source TEXT)",
        ))
        .up(
            MigrationStep::transform(
                "copy-published",
                DataTransform {
                    source_table: "blog_posts".to_string(),
                    target_table: "blog_archive".to_string(),
                    mapping: vec![
                        FieldMapping::direct("id", "id"),
                        FieldMapping::expression("headline", "upper(title)"),
                        FieldMapping::constant("source", json!("import")),
                    ],
                    filter: Some("status = 'published'".to_string()),
                    batch_size: None,
                },
            )
            .post_check("SELECT COUNT(*) FROM blog_archive", Expectation::ScalarEquals { value: json!(1) }),
        )
        .estimated_duration(5)
        .build()
        .expect("valid fixture")
}

/// A migration whose second step fails on every engine.
pub fn broken_migration(id: &str, version: &str) -> PortableMigration {
    PortableMigration::builder(id, PLUGIN, version)
        .name("broken")
        .up(MigrationStep::sql(
            "create-drafts",
            "CREATE TABLE blog_drafts (id INTEGER PRIMARY KEY)",
        ))
        .up(MigrationStep::sql(
            "insert-missing",
            "INSERT INTO blog_missing (id) VALUES (1)",
        ))
        .build()
        .expect("valid fixture")
}
