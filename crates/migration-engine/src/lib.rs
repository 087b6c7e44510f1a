//! # Migration Engine
//!
//! Portable schema and data migrations for plugin modules.
//!
//! This crate provides:
//! - A step-based migration model with per-engine SQL variants
//! - Conversion from legacy single-SQL migrations and a versioned JSON envelope
//! - Dependency ordering, drift and conflict detection
//! - Validation of single migrations and ordered plans
//! - Execution with backups, per-plugin locking, timeouts and cancellation
//! - An audit log of executions and steps, used for rollback and planning
//! - Checksummed export and import of plugin-owned tables
//!
//! ## Example
//!
//! ```rust,no_run
//! use migration_engine::{
//!     EngineConfig, MigrationEngine, MigrationExecutionContext, MigrationStep, PortableMigration,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::builder()
//!         .database_url("sqlite://plugins.db")
//!         .build()?;
//!     let engine = MigrationEngine::connect(config).await?;
//!
//!     let migration = PortableMigration::builder("blog-1.0.0", "blog", "1.0.0")
//!         .up(MigrationStep::sql("create-posts", "CREATE TABLE blog_posts (id INTEGER PRIMARY KEY)"))
//!         .build()?;
//!
//!     let context = MigrationExecutionContext::new(engine.database_engine());
//!     let result = engine.execute_migration(&migration, &context).await?;
//!     println!("{} step(s) succeeded", result.successful_steps);
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod audit;
pub mod backup;
pub mod catalog;
pub mod checksum;
pub mod classify;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod expression;
pub mod model;
pub mod plugins;
pub mod resolver;
pub mod validator;

#[cfg(test)]
mod testing;

pub use adapter::{FormatAdapter, MigrationEnvelope, RawMigration, ENVELOPE_FORMAT};
pub use audit::{AppliedMigration, ExecutionLog, ExecutionRecord, ExecutionStatus, StepRecord};
pub use backup::{BackupInfo, BackupManager, BackupSnapshot, FileBackupManager};
pub use catalog::{DirectoryCatalog, InMemoryCatalog, MigrationCatalog};
pub use classify::{HeuristicClassifier, SqlClassification, SqlClassifier};
pub use config::{DatabaseEngine, EngineConfig, EngineConfigBuilder};
pub use db::{DatabaseClient, DatabaseTransaction, PoolConfig, Row, SqlxDatabase};
pub use engine::{MigrationEngine, MigrationEngineBuilder, SessionInfo};
pub use error::{MigrationError, Result};
pub use expression::{Expression, ExpressionError};
pub use model::*;
pub use plugins::{PluginInfo, PluginRegistry, StaticPluginRegistry};
pub use resolver::{resolve_dependencies, resolve_with_applied, AppliedState, DependencyResolver};
pub use validator::MigrationValidator;

/// Re-export sqlx types for convenience
pub use sqlx;
