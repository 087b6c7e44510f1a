//! Pattern-based SQL classification.
//!
//! Type inference, risk scoring and affected-object extraction all live behind
//! [`SqlClassifier`] so the orchestrator never looks at SQL text directly. The
//! shipped [`HeuristicClassifier`] works on keywords, not a grammar.

use crate::model::{ChangeSummary, MigrationStep, MigrationType, RiskLevel};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[allow(clippy::expect_used)]
pub(crate) fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("static pattern compiles")
}

/// Operation a migration performs on a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableOperation {
    /// `CREATE TABLE`.
    Create,
    /// `ALTER TABLE`.
    Alter,
    /// `DROP TABLE`.
    Drop,
    /// `TRUNCATE`.
    Truncate,
}

impl TableOperation {
    /// Whether the operation removes data.
    #[must_use]
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Drop | Self::Truncate)
    }
}

impl std::fmt::Display for TableOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Alter => "ALTER",
            Self::Drop => "DROP",
            Self::Truncate => "TRUNCATE",
        };
        f.write_str(s)
    }
}

/// Operation a migration performs on an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexOperation {
    /// `CREATE INDEX`.
    Create,
    /// `DROP INDEX`.
    Drop,
}

impl std::fmt::Display for IndexOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => f.write_str("CREATE"),
            Self::Drop => f.write_str("DROP"),
        }
    }
}

/// What a block of SQL does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SqlClassification {
    /// Inferred migration type.
    pub migration_type: MigrationType,
    /// Weighted keyword score.
    pub risk_score: u32,
    /// Level derived from the score.
    pub risk_level: RiskLevel,
    /// The SQL matches a destructive pattern.
    pub destructive: bool,
    /// Table name to the last operation applied to it.
    pub tables: BTreeMap<String, TableOperation>,
    /// Index name to the last operation applied to it.
    pub indexes: BTreeMap<String, IndexOperation>,
}

impl SqlClassification {
    /// Schema-level part of a change tally.
    #[must_use]
    pub fn schema_changes(&self) -> ChangeSummary {
        let mut changes = ChangeSummary::default();
        for op in self.tables.values() {
            match op {
                TableOperation::Create => changes.tables_created += 1,
                TableOperation::Alter => changes.tables_modified += 1,
                TableOperation::Drop | TableOperation::Truncate => changes.tables_dropped += 1,
            }
        }
        for op in self.indexes.values() {
            match op {
                IndexOperation::Create => changes.indexes_created += 1,
                IndexOperation::Drop => changes.indexes_dropped += 1,
            }
        }
        changes
    }
}

/// Classifies SQL text.
pub trait SqlClassifier: Send + Sync + std::fmt::Debug {
    /// Classify one block of SQL (may contain several statements).
    fn classify(&self, sql: &str) -> SqlClassification;

    /// Classify the canonical SQL of a step sequence as one block.
    fn classify_steps(&self, steps: &[MigrationStep]) -> SqlClassification {
        let sql = steps
            .iter()
            .filter_map(MigrationStep::universal_sql)
            .collect::<Vec<_>>()
            .join(";\n");
        self.classify(&sql)
    }
}

static TYPE_PATTERNS: Lazy<Vec<(MigrationType, Regex)>> = Lazy::new(|| {
    vec![
        (
            MigrationType::Schema,
            pattern(r"(?i)\b(CREATE|ALTER|DROP)\s+TABLE\b"),
        ),
        (
            MigrationType::Data,
            pattern(r"(?i)\b(INSERT\s+INTO|DELETE\s+FROM)\b|\bUPDATE\s+[\w.]+\s+SET\b"),
        ),
        (
            MigrationType::Index,
            pattern(r"(?i)\b(CREATE\s+(UNIQUE\s+)?INDEX|DROP\s+INDEX)\b"),
        ),
        (
            MigrationType::Function,
            pattern(r"(?i)\bCREATE\s+(OR\s+REPLACE\s+)?(FUNCTION|PROCEDURE)\b"),
        ),
        (
            MigrationType::Trigger,
            pattern(r"(?i)\bCREATE\s+(OR\s+REPLACE\s+)?TRIGGER\b"),
        ),
        (
            MigrationType::View,
            pattern(r"(?i)\bCREATE\s+(OR\s+REPLACE\s+)?(MATERIALIZED\s+)?VIEW\b"),
        ),
        (
            MigrationType::Constraint,
            pattern(r"(?i)\b(ADD|DROP)\s+CONSTRAINT\b"),
        ),
        (
            MigrationType::Extension,
            pattern(r"(?i)\bCREATE\s+EXTENSION\b"),
        ),
    ]
});

static DROP_TABLE_OR_DATABASE: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?i)\bDROP\s+(TABLE|DATABASE)\b"));
static DROP_TABLE: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)\bDROP\s+TABLE\b"));
static DROP_DATABASE: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)\bDROP\s+DATABASE\b"));
static TRUNCATE: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)\bTRUNCATE\b"));
static DROP_COLUMN: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)\bDROP\s+COLUMN\b"));
static ALTER_COLUMN: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)\bALTER\s+COLUMN\b"));
static DROP_INDEX: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)\bDROP\s+INDEX\b"));
static CREATE_TABLE_OR_INDEX: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?i)\bCREATE\s+(UNIQUE\s+)?(TABLE|INDEX)\b"));

static DELETE_STATEMENT: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)^\s*DELETE\s+FROM\b"));
static UPDATE_STATEMENT: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)^\s*UPDATE\b"));
static INSERT_STATEMENT: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)^\s*INSERT\s+INTO\b"));
static WHERE_CLAUSE: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)\bWHERE\b"));

const IDENT: &str = r#"([\w."`\[\]]+)"#;

static TABLE_OPERATION: Lazy<Regex> = Lazy::new(|| {
    pattern(&format!(
        r"(?i)\b(CREATE|ALTER|DROP)\s+TABLE\s+(?:IF\s+(?:NOT\s+)?EXISTS\s+)?{IDENT}"
    ))
});
static TRUNCATE_TABLE: Lazy<Regex> =
    Lazy::new(|| pattern(&format!(r"(?i)\bTRUNCATE\s+(?:TABLE\s+)?{IDENT}")));
static INDEX_OPERATION: Lazy<Regex> = Lazy::new(|| {
    pattern(&format!(
        r"(?i)\b(CREATE\s+(?:UNIQUE\s+)?INDEX|DROP\s+INDEX)\s+(?:CONCURRENTLY\s+)?(?:IF\s+(?:NOT\s+)?EXISTS\s+)?{IDENT}"
    ))
});

/// Keyword-driven classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    /// Create a classifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Inferred type: first match in priority order, `schema` when nothing matches.
    #[must_use]
    pub fn infer_type(sql: &str) -> MigrationType {
        TYPE_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(sql))
            .map_or(MigrationType::Schema, |(t, _)| *t)
    }

    /// Weighted keyword score. Each pattern counts at most once.
    #[must_use]
    pub fn risk_score(sql: &str) -> u32 {
        let statements = split_statements(sql);
        let mut score = 0;
        if DROP_TABLE_OR_DATABASE.is_match(sql) {
            score += 50;
        }
        if statements.iter().any(|s| is_unqualified_delete(s)) {
            score += 40;
        }
        if TRUNCATE.is_match(sql) {
            score += 30;
        }
        if DROP_COLUMN.is_match(sql) {
            score += 25;
        }
        if statements.iter().any(|s| is_unqualified_update(s)) {
            score += 20;
        }
        if ALTER_COLUMN.is_match(sql) {
            score += 15;
        }
        if DROP_INDEX.is_match(sql) {
            score += 10;
        }
        if CREATE_TABLE_OR_INDEX.is_match(sql) {
            score += 5;
        }
        score
    }

    /// Level for a score: ≥40 critical, ≥25 high, ≥10 medium.
    #[must_use]
    pub fn risk_level(score: u32) -> RiskLevel {
        match score {
            s if s >= 40 => RiskLevel::Critical,
            s if s >= 25 => RiskLevel::High,
            s if s >= 10 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    /// Whether the SQL matches a destructive pattern.
    #[must_use]
    pub fn is_destructive(sql: &str) -> bool {
        DROP_TABLE.is_match(sql)
            || TRUNCATE.is_match(sql)
            || DROP_COLUMN.is_match(sql)
            || ALTER_COLUMN.is_match(sql)
            || split_statements(sql).iter().any(|s| is_unqualified_delete(s))
    }

    fn objects(sql: &str) -> (BTreeMap<String, TableOperation>, BTreeMap<String, IndexOperation>) {
        let mut tables = BTreeMap::new();
        let mut indexes = BTreeMap::new();

        for statement in split_statements(sql) {
            for caps in TABLE_OPERATION.captures_iter(&statement) {
                let op = match caps[1].to_ascii_uppercase().as_str() {
                    "CREATE" => TableOperation::Create,
                    "ALTER" => TableOperation::Alter,
                    _ => TableOperation::Drop,
                };
                tables.insert(normalize_ident(&caps[2]), op);
            }
            for caps in TRUNCATE_TABLE.captures_iter(&statement) {
                tables.insert(normalize_ident(&caps[1]), TableOperation::Truncate);
            }
            for caps in INDEX_OPERATION.captures_iter(&statement) {
                let name = normalize_ident(&caps[2]);
                // `CREATE INDEX ON t (...)` has no name
                if name == "on" {
                    continue;
                }
                let op = if caps[1].to_ascii_uppercase().starts_with("CREATE") {
                    IndexOperation::Create
                } else {
                    IndexOperation::Drop
                };
                indexes.insert(name, op);
            }
        }

        (tables, indexes)
    }
}

impl SqlClassifier for HeuristicClassifier {
    fn classify(&self, sql: &str) -> SqlClassification {
        let risk_score = Self::risk_score(sql);
        let (tables, indexes) = Self::objects(sql);
        SqlClassification {
            migration_type: Self::infer_type(sql),
            risk_score,
            risk_level: Self::risk_level(risk_score),
            destructive: Self::is_destructive(sql),
            tables,
            indexes,
        }
    }
}

/// Strip quoting and lowercase an identifier.
#[must_use]
pub fn normalize_ident(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '"' | '`' | '[' | ']'))
        .collect::<String>()
        .to_ascii_lowercase()
}

/// `DELETE FROM` without a `WHERE` clause.
#[must_use]
pub fn is_unqualified_delete(statement: &str) -> bool {
    DELETE_STATEMENT.is_match(statement) && !WHERE_CLAUSE.is_match(statement)
}

/// `UPDATE` without a `WHERE` clause.
#[must_use]
pub fn is_unqualified_update(statement: &str) -> bool {
    UPDATE_STATEMENT.is_match(statement) && !WHERE_CLAUSE.is_match(statement)
}

/// Statements the validator refuses outright.
#[must_use]
pub fn dangerous_statements(sql: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    if DROP_DATABASE.is_match(sql) {
        found.push("DROP DATABASE");
    }
    if TRUNCATE.is_match(sql) {
        found.push("TRUNCATE");
    }
    if split_statements(sql).iter().any(|s| is_unqualified_delete(s)) {
        found.push("DELETE FROM without WHERE");
    }
    found
}

/// Row-level statement kind, used to attribute affected-row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// `INSERT INTO`.
    Insert,
    /// `UPDATE`.
    Update,
    /// `DELETE FROM`.
    Delete,
    /// Anything else.
    Other,
}

impl StatementKind {
    /// Kind of a single statement.
    #[must_use]
    pub fn of(statement: &str) -> Self {
        if INSERT_STATEMENT.is_match(statement) {
            Self::Insert
        } else if UPDATE_STATEMENT.is_match(statement) {
            Self::Update
        } else if DELETE_STATEMENT.is_match(statement) {
            Self::Delete
        } else {
            Self::Other
        }
    }

    /// Add `rows` to the matching row counter.
    pub fn tally(self, changes: &mut ChangeSummary, rows: u64) {
        match self {
            Self::Insert => changes.rows_inserted += rows,
            Self::Update => changes.rows_updated += rows,
            Self::Delete => changes.rows_deleted += rows,
            Self::Other => {}
        }
    }
}

/// Split SQL into statements on `;`.
///
/// Semicolons inside quoted strings, quoted identifiers, comments and
/// dollar-quoted bodies do not split. Comments are dropped, statements are
/// trimmed and empty statements are omitted.
#[must_use]
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    let mut flush = |current: &mut String| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            statements.push(trimmed.to_string());
        }
        current.clear();
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let end = scan_quoted(&chars, i, c);
                current.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
                current.push(' ');
            }
            '$' => match dollar_tag(&chars, i) {
                Some(tag) => {
                    let body_start = i + tag.len();
                    let end = find_tag(&chars, body_start, &tag)
                        .map_or(chars.len(), |pos| pos + tag.len());
                    current.extend(&chars[i..end]);
                    i = end;
                }
                None => {
                    current.push(c);
                    i += 1;
                }
            },
            ';' => {
                flush(&mut current);
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    flush(&mut current);

    statements
}

// Index one past the closing quote; doubled quotes are escapes.
fn scan_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

// `$$` or `$name$` starting at `start`; `$1` placeholders are not tags.
fn dollar_tag(chars: &[char], start: usize) -> Option<Vec<char>> {
    let mut i = start + 1;
    if chars.get(i).is_some_and(char::is_ascii_digit) {
        return None;
    }
    while let Some(&c) = chars.get(i) {
        if c == '$' {
            return Some(chars[start..=i].to_vec());
        }
        if !(c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        i += 1;
    }
    None
}

fn find_tag(chars: &[char], from: usize, tag: &[char]) -> Option<usize> {
    (from..chars.len()).find(|&pos| chars[pos..].starts_with(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_quotes_and_bodies() {
        let sql = r"
            -- create things; carefully
            CREATE TABLE a (v TEXT DEFAULT 'x;y');
            /* block; comment */
            CREATE FUNCTION f() RETURNS trigger AS $$ BEGIN RETURN NEW; END; $$ LANGUAGE plpgsql;
            INSERT INTO a VALUES ($1);
        ";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "CREATE TABLE a (v TEXT DEFAULT 'x;y')");
        assert!(statements[1].contains("RETURN NEW; END; $$"));
        assert_eq!(statements[2], "INSERT INTO a VALUES ($1)");
    }

    #[test]
    fn test_split_tagged_dollar_quote() {
        let statements = split_statements("DO $body$ SELECT 1; $body$; SELECT 2");
        assert_eq!(statements, vec!["DO $body$ SELECT 1; $body$", "SELECT 2"]);
    }

    #[test]
    fn test_infer_type_priority() {
        assert_eq!(
            HeuristicClassifier::infer_type("CREATE TABLE t (id INT); INSERT INTO t VALUES (1)"),
            MigrationType::Schema
        );
        assert_eq!(
            HeuristicClassifier::infer_type("INSERT INTO t VALUES (1); CREATE INDEX i ON t (id)"),
            MigrationType::Data
        );
        assert_eq!(
            HeuristicClassifier::infer_type("CREATE UNIQUE INDEX i ON t (id)"),
            MigrationType::Index
        );
        assert_eq!(
            HeuristicClassifier::infer_type("CREATE OR REPLACE VIEW v AS SELECT 1"),
            MigrationType::View
        );
        assert_eq!(
            HeuristicClassifier::infer_type("CREATE EXTENSION pgcrypto"),
            MigrationType::Extension
        );
        assert_eq!(HeuristicClassifier::infer_type("SELECT 1"), MigrationType::Schema);
    }

    #[test]
    fn test_risk_scoring() {
        assert_eq!(HeuristicClassifier::risk_score("CREATE TABLE t (id INT)"), 5);
        assert_eq!(
            HeuristicClassifier::risk_level(HeuristicClassifier::risk_score(
                "CREATE TABLE t (id INT)"
            )),
            RiskLevel::Low
        );
        assert_eq!(HeuristicClassifier::risk_score("DROP TABLE t"), 50);
        assert_eq!(HeuristicClassifier::risk_score("DELETE FROM t"), 40);
        assert_eq!(HeuristicClassifier::risk_score("DELETE FROM t WHERE id = 1"), 0);
        assert_eq!(
            HeuristicClassifier::risk_score("UPDATE t SET a = 1; ALTER TABLE t ALTER COLUMN a TYPE TEXT"),
            35
        );
        assert_eq!(HeuristicClassifier::risk_level(35), RiskLevel::High);
        assert_eq!(HeuristicClassifier::risk_level(10), RiskLevel::Medium);
        assert_eq!(HeuristicClassifier::risk_level(40), RiskLevel::Critical);
    }

    #[test]
    fn test_destructive_patterns() {
        assert!(HeuristicClassifier::is_destructive("ALTER TABLE t DROP COLUMN c"));
        assert!(HeuristicClassifier::is_destructive("TRUNCATE t"));
        assert!(HeuristicClassifier::is_destructive("DELETE FROM t"));
        assert!(!HeuristicClassifier::is_destructive("DELETE FROM t WHERE a = 1"));
        assert!(!HeuristicClassifier::is_destructive("CREATE TABLE t (id INT)"));
    }

    #[test]
    fn test_object_extraction() {
        let c = HeuristicClassifier.classify(
            r#"CREATE TABLE IF NOT EXISTS "Blog_Posts" (id INT);
               ALTER TABLE comments ADD COLUMN x INT;
               TRUNCATE TABLE stats;
               CREATE UNIQUE INDEX IF NOT EXISTS idx_posts ON blog_posts (id);
               CREATE INDEX ON comments (x);
               DROP INDEX old_idx"#,
        );
        assert_eq!(c.tables.get("blog_posts"), Some(&TableOperation::Create));
        assert_eq!(c.tables.get("comments"), Some(&TableOperation::Alter));
        assert_eq!(c.tables.get("stats"), Some(&TableOperation::Truncate));
        assert_eq!(c.indexes.get("idx_posts"), Some(&IndexOperation::Create));
        assert_eq!(c.indexes.get("old_idx"), Some(&IndexOperation::Drop));
        assert!(!c.indexes.contains_key("on"));

        let changes = c.schema_changes();
        assert_eq!(changes.tables_created, 1);
        assert_eq!(changes.tables_modified, 1);
        assert_eq!(changes.tables_dropped, 1);
        assert_eq!(changes.indexes_created, 1);
        assert_eq!(changes.indexes_dropped, 1);
    }

    #[test]
    fn test_dangerous_statements() {
        assert_eq!(
            dangerous_statements("DROP DATABASE prod; DELETE FROM users"),
            vec!["DROP DATABASE", "DELETE FROM without WHERE"]
        );
        assert!(dangerous_statements("DELETE FROM users WHERE id = 1").is_empty());
    }

    #[test]
    fn test_statement_kind_tally() {
        let mut changes = ChangeSummary::default();
        StatementKind::of("INSERT INTO t VALUES (1)").tally(&mut changes, 3);
        StatementKind::of("  update t set a = 1").tally(&mut changes, 2);
        StatementKind::of("DELETE FROM t WHERE a = 1").tally(&mut changes, 1);
        StatementKind::of("CREATE TABLE x (id INT)").tally(&mut changes, 9);
        assert_eq!(changes.rows_inserted, 3);
        assert_eq!(changes.rows_updated, 2);
        assert_eq!(changes.rows_deleted, 1);
    }
}
