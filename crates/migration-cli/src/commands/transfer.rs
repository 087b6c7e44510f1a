//! Export and import commands - move a plugin's rows between databases.

use anyhow::{Context, Result};
use clap::Args;
use migration_engine::{DataExport, DataImport, ImportOptions, ImportResult};
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use crate::cli::GlobalArgs;
use crate::output::{self, CommandResult, OutputFormat};

/// Arguments for the export command.
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Plugin id
    pub plugin: String,

    /// Write the export here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the import command.
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Data export (JSON)
    pub file: PathBuf,

    /// Upsert on the primary key instead of inserting
    #[arg(long)]
    pub overwrite: bool,

    /// Continue past failing records
    #[arg(long)]
    pub skip_errors: bool,

    /// Records per batch
    #[arg(long, default_value = "500")]
    pub batch_size: usize,

    /// Skip checksum and schema verification
    #[arg(long)]
    pub no_validate: bool,
}

impl ImportArgs {
    fn options(&self) -> ImportOptions {
        ImportOptions {
            overwrite: self.overwrite,
            skip_errors: self.skip_errors,
            batch_size: self.batch_size,
            validate: !self.no_validate,
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportSummary<'a> {
    plugin_id: &'a str,
    tables: usize,
    rows: usize,
    size: u64,
    checksum: &'a str,
    output: String,
}

#[derive(Debug, Tabled)]
struct TableRow {
    #[tabled(rename = "Table")]
    table: String,
    #[tabled(rename = "Rows")]
    rows: usize,
    #[tabled(rename = "Primary key")]
    primary_key: String,
}

fn table_rows(export: &DataExport) -> Vec<TableRow> {
    export
        .tables
        .iter()
        .map(|(name, rows)| TableRow {
            table: name.clone(),
            rows: rows.len(),
            primary_key: export
                .schema
                .get(name)
                .map(|s| s.primary_key.join(", "))
                .unwrap_or_default(),
        })
        .collect()
}

/// Execute the export command.
pub async fn execute_export(args: ExportArgs, global: &GlobalArgs) -> Result<()> {
    let engine = global.connect().await?;
    let export = engine
        .export_data(&args.plugin)
        .await
        .map_err(|e| anyhow::anyhow!("Export failed: {}", e))?;
    let json = serde_json::to_string_pretty(&export)?;

    let Some(path) = &args.output else {
        return super::write_or_print(None, &json);
    };
    super::write_or_print(Some(path), &json)?;

    let format = global.format();
    match format {
        OutputFormat::Json => {
            CommandResult::success(ExportSummary {
                plugin_id: &export.plugin_id,
                tables: export.tables.len(),
                rows: export.row_count(),
                size: export.size,
                checksum: &export.checksum,
                output: path.display().to_string(),
            })
            .print(format)?;
        }
        OutputFormat::Text => {
            output::section(&format!("Export of {}", export.plugin_id));
            output::table(&table_rows(&export));
            output::key_value("Rows", &export.row_count().to_string());
            output::key_value("Size", &output::format_bytes(export.size));
            output::key_value("Checksum", &export.checksum);
            output::success(&format!("Wrote {}", path.display()));
        }
    }
    Ok(())
}

/// Execute the import command.
pub async fn execute_import(args: ImportArgs, global: &GlobalArgs) -> Result<()> {
    let content = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let data: DataExport = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", args.file.display()))?;

    let engine = global.connect().await?;
    let import = DataImport {
        data,
        options: args.options(),
    };
    let result = engine
        .import_data(&import)
        .await
        .map_err(|e| anyhow::anyhow!("Import rejected: {}", e))?;

    print_import(&import.data, &result, global.format())
}

fn print_import(data: &DataExport, result: &ImportResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let error = result
                .errors
                .first()
                .map(|e| format!("{}[{}]: {}", e.table, e.record_index, e.message));
            CommandResult::outcome(result.success, result, error).print(format)?;
        }
        OutputFormat::Text => {
            output::section(&format!("Import of {}", data.plugin_id));
            output::key_value("Tables", &result.tables_imported.to_string());
            output::key_value("Imported", &result.records_imported.to_string());
            output::key_value("Failed", &result.records_failed.to_string());
            output::key_value("Duration", &output::format_millis(result.duration_ms));
            for error in &result.errors {
                output::error(&format!(
                    "{}[{}]: {}",
                    error.table, error.record_index, error.message
                ));
            }
            if result.success {
                output::success("Import completed");
            }
        }
    }

    if result.success {
        Ok(())
    } else {
        anyhow::bail!("Import of {} did not complete", data.plugin_id)
    }
}
