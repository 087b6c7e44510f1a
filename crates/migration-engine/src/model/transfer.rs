//! Plugin data export and import payloads.

use crate::checksum;
use crate::db::Row;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Portable column description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Inferred type: `integer`, `real`, `text`, `boolean`, `json` or `unknown`.
    pub data_type: String,
    /// At least one row holds NULL.
    pub nullable: bool,
}

/// Portable table description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Columns sorted by name.
    pub columns: Vec<ColumnSchema>,
    /// Primary key columns.
    pub primary_key: Vec<String>,
    /// Row count at export time.
    pub row_count: usize,
}

impl TableSchema {
    /// Infer a schema from exported rows.
    #[must_use]
    pub fn infer(rows: &[Row]) -> Self {
        let mut types: BTreeMap<String, (BTreeSet<&'static str>, bool)> = BTreeMap::new();
        for row in rows {
            for (name, value) in row {
                let entry = types.entry(name.clone()).or_default();
                match value_type(value) {
                    Some(t) => {
                        entry.0.insert(t);
                    }
                    None => entry.1 = true,
                }
            }
        }

        let columns: Vec<ColumnSchema> = types
            .into_iter()
            .map(|(name, (seen, nullable))| {
                let data_type = match seen.len() {
                    0 => "unknown",
                    1 => seen.iter().next().copied().unwrap_or("unknown"),
                    // integer + real widens to real; anything else is text
                    2 if seen.contains("integer") && seen.contains("real") => "real",
                    _ => "text",
                };
                ColumnSchema {
                    name,
                    data_type: data_type.to_string(),
                    nullable,
                }
            })
            .collect();

        let primary_key = if columns.iter().any(|c| c.name == "id") {
            vec!["id".to_string()]
        } else {
            Vec::new()
        };

        Self {
            columns,
            primary_key,
            row_count: rows.len(),
        }
    }

    /// Column names in schema order.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

fn value_type(value: &Value) -> Option<&'static str> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some("boolean"),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some("integer"),
        Value::Number(_) => Some("real"),
        Value::String(_) => Some("text"),
        Value::Array(_) | Value::Object(_) => Some("json"),
    }
}

/// Snapshot of every table a plugin owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataExport {
    /// Plugin id.
    pub plugin_id: String,
    /// Export time.
    pub exported_at: DateTime<Utc>,
    /// Rows keyed by table name.
    pub tables: BTreeMap<String, Vec<Row>>,
    /// Schema keyed by table name.
    pub schema: BTreeMap<String, TableSchema>,
    /// Canonical hash of `tables`.
    pub checksum: String,
    /// Size of the serialized table data in bytes.
    pub size: u64,
}

impl DataExport {
    /// Build an export, computing schema, checksum and size.
    #[must_use]
    pub fn new(plugin_id: impl Into<String>, tables: BTreeMap<String, Vec<Row>>) -> Self {
        let schema = tables
            .iter()
            .map(|(name, rows)| (name.clone(), TableSchema::infer(rows)))
            .collect();
        let checksum = Self::compute_checksum(&tables);
        let size = checksum::canonical_json(&tables).len() as u64;

        Self {
            plugin_id: plugin_id.into(),
            exported_at: Utc::now(),
            tables,
            schema,
            checksum,
            size,
        }
    }

    /// Checksum over table contents.
    #[must_use]
    pub fn compute_checksum(tables: &BTreeMap<String, Vec<Row>>) -> String {
        checksum::canonical_hash(tables)
    }

    /// Whether the stored checksum matches the contents.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        Self::compute_checksum(&self.tables) == self.checksum
    }

    /// Total rows across tables.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// Import switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    /// Upsert on the primary key instead of plain inserts.
    #[serde(default)]
    pub overwrite: bool,
    /// Continue past per-record failures.
    #[serde(default)]
    pub skip_errors: bool,
    /// Records per batch.
    #[serde(default = "default_import_batch")]
    pub batch_size: usize,
    /// Verify checksum and schema before writing anything.
    #[serde(default = "default_validate")]
    pub validate: bool,
}

fn default_import_batch() -> usize {
    500
}

fn default_validate() -> bool {
    true
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            skip_errors: false,
            batch_size: default_import_batch(),
            validate: default_validate(),
        }
    }
}

/// An export plus how to import it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataImport {
    /// Data to import.
    pub data: DataExport,
    /// Options.
    #[serde(default)]
    pub options: ImportOptions,
}

/// A record that failed to import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    /// Table name.
    pub table: String,
    /// Index of the record in the table's row list.
    pub record_index: usize,
    /// Error text.
    pub message: String,
    /// The offending record.
    pub record: Row,
}

/// Import outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    /// No errors, or errors were explicitly tolerated.
    pub success: bool,
    /// Tables written to.
    pub tables_imported: usize,
    /// Records written.
    pub records_imported: usize,
    /// Records that failed.
    pub records_failed: usize,
    /// Per-record errors.
    pub errors: Vec<RecordError>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_schema_inference() {
        let rows = vec![
            row(json!({"id": 1, "title": "a", "score": 1, "meta": null})),
            row(json!({"id": 2, "title": "b", "score": 2.5, "meta": {"x": 1}})),
        ];
        let schema = TableSchema::infer(&rows);

        assert_eq!(schema.row_count, 2);
        assert_eq!(schema.primary_key, vec!["id"]);
        let by_name: BTreeMap<_, _> = schema
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c))
            .collect();
        assert_eq!(by_name["id"].data_type, "integer");
        assert_eq!(by_name["score"].data_type, "real");
        assert_eq!(by_name["meta"].data_type, "json");
        assert!(by_name["meta"].nullable);
        assert!(!by_name["title"].nullable);
    }

    #[test]
    fn test_export_checksum() {
        let mut tables = BTreeMap::new();
        tables.insert("blog_posts".to_string(), vec![row(json!({"id": 1}))]);
        let mut export = DataExport::new("blog", tables);

        assert!(export.verify_checksum());
        assert_eq!(export.row_count(), 1);
        assert!(export.size > 0);

        export
            .tables
            .get_mut("blog_posts")
            .unwrap()
            .push(row(json!({"id": 2})));
        assert!(!export.verify_checksum());
    }

    #[test]
    fn test_import_defaults() {
        let options: ImportOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ImportOptions::default());
        assert!(options.validate);
        assert_eq!(options.batch_size, 500);
    }
}
