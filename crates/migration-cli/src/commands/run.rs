//! Run command - execute one migration envelope.

use anyhow::Result;
use clap::Args;
use migration_engine::{Direction, ExecutionOptions, MigrationExecutionContext};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::GlobalArgs;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Migration envelope (JSON)
    pub file: PathBuf,

    /// Run the down sequence instead of up
    #[arg(long)]
    pub down: bool,

    /// Record the run without executing SQL
    #[arg(long)]
    pub dry_run: bool,

    /// Proceed despite critical conflicts
    #[arg(long)]
    pub force: bool,

    /// Do not create a backup even if the migration requires one
    #[arg(long)]
    pub skip_backup: bool,

    /// Do not validate before executing
    #[arg(long)]
    pub skip_validation: bool,

    /// Upper bound for the whole run (e.g. 30s, 5m)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Run every step inside one transaction
    #[arg(long)]
    pub atomic: bool,

    /// Rows per transform batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Extra SQL predicate for transform source rows
    #[arg(long)]
    pub data_filter: Option<String>,

    /// Session id (generated when omitted)
    #[arg(long)]
    pub session_id: Option<String>,

    /// Recorded as the initiator of the run
    #[arg(long, env = "USER")]
    pub initiated_by: Option<String>,
}

impl RunArgs {
    fn context(&self, engine: migration_engine::DatabaseEngine) -> MigrationExecutionContext {
        let direction = if self.down { Direction::Down } else { Direction::Up };
        let mut context = MigrationExecutionContext::new(engine)
            .direction(direction)
            .dry_run(self.dry_run)
            .force(self.force)
            .options(ExecutionOptions {
                skip_backup: self.skip_backup,
                skip_validation: self.skip_validation,
                batch_size: self.batch_size,
                timeout: self.timeout,
                atomic: self.atomic,
            });
        if let Some(session_id) = &self.session_id {
            context = context.session_id(session_id);
        }
        if let Some(filter) = &self.data_filter {
            context = context.data_filter(filter);
        }
        context.initiated_by.clone_from(&self.initiated_by);
        context
    }
}

/// Execute the run command.
pub async fn execute(args: RunArgs, global: &GlobalArgs) -> Result<()> {
    let engine = global.connect().await?;
    let migration = super::read_migration(&args.file, engine.adapter())?;
    let context = args.context(engine.database_engine());

    tracing::info!(
        migration_id = %migration.id,
        session_id = %context.session_id,
        direction = %context.direction,
        "Starting migration from CLI"
    );

    let result = engine
        .execute_migration(&migration, &context)
        .await
        .map_err(|e| anyhow::anyhow!("Migration {} rejected: {}", migration.id, e))?;

    super::print_result(&result, global.format())
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration_engine::DatabaseEngine;

    #[test]
    fn test_context_from_flags() {
        let args = RunArgs {
            file: PathBuf::from("blog.json"),
            down: true,
            dry_run: false,
            force: true,
            skip_backup: true,
            skip_validation: false,
            timeout: Some(Duration::from_secs(5)),
            atomic: true,
            batch_size: Some(50),
            data_filter: Some("id > 10".to_string()),
            session_id: Some("deploy-42".to_string()),
            initiated_by: Some("ops".to_string()),
        };

        let context = args.context(DatabaseEngine::SQLite);
        assert_eq!(context.direction, Direction::Down);
        assert!(context.force);
        assert!(context.options.atomic);
        assert_eq!(context.options.batch_size, Some(50));
        assert_eq!(context.session_id, "deploy-42");
        assert_eq!(context.data_filter.as_deref(), Some("id > 10"));
        assert_eq!(context.initiated_by.as_deref(), Some("ops"));
        assert_eq!(context.database_engine, DatabaseEngine::SQLite);
    }
}
