//! CLI argument definitions using clap.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use migration_engine::{DatabaseEngine, EngineConfig, MigrationEngine};
use std::path::PathBuf;

use crate::commands;
use crate::output::OutputFormat;

/// Plugin migrations - portable schema and data changes for plugin modules
#[derive(Parser, Debug)]
#[command(name = "plugin-migrate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Increase output verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Engine configuration file (TOML or YAML)
    #[arg(short, long, env = "PLUGIN_MIGRATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database URL, overrides the configuration file
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

impl GlobalArgs {
    /// Output format selected by `--json`.
    pub fn format(&self) -> OutputFormat {
        OutputFormat::from_json_flag(self.json)
    }

    /// Engine configuration from `--config` and `--database-url`.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => EngineConfig::default(),
        };

        if let Some(url) = &self.database_url {
            if let Some(engine) = DatabaseEngine::from_url(url) {
                config.database_engine = engine;
            }
            config.database_url.clone_from(url);
        }

        config
            .validate()
            .context("DATABASE_URL environment variable, --database-url or --config required")?;
        Ok(config)
    }

    /// Connect an engine using [`GlobalArgs::engine_config`].
    pub async fn connect(&self) -> Result<MigrationEngine> {
        let config = self.engine_config()?;
        MigrationEngine::connect(config)
            .await
            .context("Failed to connect")
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a migration envelope
    Run(commands::run::RunArgs),

    /// Roll back a previously applied migration
    Rollback(commands::rollback::RollbackArgs),

    /// Plan the migrations that bring a plugin to a version
    Plan(commands::plan::PlanArgs),

    /// Show execution history
    Status(commands::status::StatusArgs),

    /// Validate a migration envelope without a database
    Validate(commands::validate::ValidateArgs),

    /// Convert a legacy SQL migration into an envelope
    Convert(commands::convert::ConvertArgs),

    /// Render a migration envelope as a SQL file
    Render(commands::render::RenderArgs),

    /// Export a plugin's tables
    Export(commands::transfer::ExportArgs),

    /// Import a data export
    Import(commands::transfer::ImportArgs),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let global = self.global;
        match self.command {
            Commands::Run(args) => commands::run::execute(args, &global).await,
            Commands::Rollback(args) => commands::rollback::execute(args, &global).await,
            Commands::Plan(args) => commands::plan::execute(args, &global).await,
            Commands::Status(args) => commands::status::execute(args, &global).await,
            Commands::Validate(args) => commands::validate::execute(args, &global).await,
            Commands::Convert(args) => commands::convert::execute(args, &global).await,
            Commands::Render(args) => commands::render::execute(args, &global).await,
            Commands::Export(args) => commands::transfer::execute_export(args, &global).await,
            Commands::Import(args) => commands::transfer::execute_import(args, &global).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_database_url_override_detects_engine() {
        let global = GlobalArgs {
            verbose: 0,
            json: false,
            config: None,
            database_url: Some("sqlite://plugins.db".to_string()),
        };
        let config = global.engine_config().unwrap();
        assert_eq!(config.database_engine, DatabaseEngine::SQLite);
        assert_eq!(config.database_url, "sqlite://plugins.db");
    }

    #[test]
    fn test_missing_database_url_is_reported() {
        let global = GlobalArgs {
            verbose: 0,
            json: false,
            config: None,
            database_url: None,
        };
        assert!(global.engine_config().is_err());
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "plugin-migrate",
            "--json",
            "run",
            "blog.json",
            "--down",
            "--dry-run",
            "--timeout",
            "30s",
        ])
        .unwrap();
        assert!(cli.global.json);
        match cli.command {
            Commands::Run(args) => {
                assert!(args.down);
                assert!(args.dry_run);
                assert_eq!(args.timeout, Some(std::time::Duration::from_secs(30)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
