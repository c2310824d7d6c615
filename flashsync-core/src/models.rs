//! Core data models for the sync pipeline.
//!
//! This module defines the schema representation shared by sources and the
//! destination, the normalized [`Record`] produced for every source row, and
//! the per-task and per-run outcome types reported by the orchestrator.

use std::collections::HashSet;
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{SyncError, redact_database_url};

/// Semantic column types used for cross-system schema comparison.
///
/// This is a closed set. Source types that do not map to any of these are
/// stored as [`SemanticType::String`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SemanticType {
    String,
    Integer,
    Float,
    Date,
    Timestamp,
    Boolean,
}

impl std::fmt::Display for SemanticType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => write!(f, "STRING"),
            Self::Integer => write!(f, "INTEGER"),
            Self::Float => write!(f, "FLOAT"),
            Self::Date => write!(f, "DATE"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

/// One column of a destination table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub field_type: SemanticType,
    /// True only when the source driver asserted non-nullability
    pub required: bool,
}

impl SchemaField {
    /// Creates a nullable field
    pub fn nullable(name: impl Into<String>, field_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Creates a required (non-null) field
    pub fn required(name: impl Into<String>, field_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }
}

/// Ordered sequence of fields with unique names.
///
/// Built fresh from a live sample query on every sync and never cached.
/// Field order is preserved for table creation but is insignificant for
/// schema comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    fields: Vec<SchemaField>,
}

impl TableSchema {
    /// Builds a schema, rejecting duplicate column names.
    pub fn new(fields: Vec<SchemaField>) -> Result<Self, SyncError> {
        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SyncError::configuration(format!(
                    "Duplicate column name '{}' in schema",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The target state a reconciler must achieve for one destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTableSpec {
    pub table: String,
    pub schema: TableSchema,
}

/// A logical source system and the tables synced from it.
///
/// The connection URL carries credentials, so `Debug` output redacts it.
#[derive(Clone, PartialEq, Eq)]
pub struct DataSource {
    pub name: String,
    pub url: String,
    pub database: String,
    pub tables: Vec<String>,
}

impl DataSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        database: impl Into<String>,
        tables: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            database: database.into(),
            tables,
        }
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name)
            .field("url", &redact_database_url(&self.url))
            .field("database", &self.database)
            .field("tables", &self.tables)
            .finish()
    }
}

/// One (source, table) pair processed by exactly one concurrent worker.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub source: Arc<DataSource>,
    pub table: String,
}

impl SyncTask {
    /// Expands every source into one task per configured table.
    pub fn enumerate(sources: &[Arc<DataSource>]) -> Vec<Self> {
        sources
            .iter()
            .flat_map(|source| {
                source.tables.iter().map(|table| Self {
                    source: Arc::clone(source),
                    table: table.clone(),
                })
            })
            .collect()
    }

    /// Display name in `source.table` form
    pub fn name(&self) -> String {
        format!("{}.{}", self.source.name, self.table)
    }
}

/// A normalized column value.
///
/// Temporal values are carried already formatted with the configured date
/// format; everything else serializes as its natural JSON type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecordValue {
    Null,
    Bool(bool),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    String(String),
    Temporal(String),
}

/// One parsed source row, keyed by column name in source column order.
///
/// Serializes as a single JSON object. Null values are emitted as explicit
/// `null` entries, never omitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    entries: Vec<(String, RecordValue)>,
}

impl Record {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, column: impl Into<String>, value: RecordValue) {
        self.entries.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&RecordValue> {
        self.entries
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (column, value) in &self.entries {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// What the reconciler did to the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Table was absent and has been created
    Created,
    /// Schema already matched; nothing was changed
    Unchanged,
    /// Schema was updated in place
    Updated,
    /// Table was deleted and recreated, discarding all rows
    Recreated,
}

impl std::fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Updated => write!(f, "updated"),
            Self::Recreated => write!(f, "recreated"),
        }
    }
}

/// Result of one extract/load cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Rows parsed and written to the load buffer
    pub rows_extracted: u64,
    /// Rows dropped because they could not be read
    pub rows_skipped: u64,
    /// Rows reported by the destination; `None` when no load was submitted
    pub rows_loaded: Option<u64>,
}

impl SyncOutcome {
    pub const fn loaded(&self) -> bool {
        self.rows_loaded.is_some()
    }
}

/// Terminal success report for one sync task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub source: String,
    pub table: String,
    pub action: ReconcileAction,
    pub outcome: SyncOutcome,
}

/// Aggregated result of a fully successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tasks: Vec<TaskReport>,
}

impl RunSummary {
    pub fn total_rows_extracted(&self) -> u64 {
        self.tasks.iter().map(|t| t.outcome.rows_extracted).sum()
    }

    pub fn total_rows_skipped(&self) -> u64 {
        self.tasks.iter().map(|t| t.outcome.rows_skipped).sum()
    }

    pub fn tables_loaded(&self) -> usize {
        self.tasks.iter().filter(|t| t.outcome.loaded()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_rejects_duplicate_columns() {
        let result = TableSchema::new(vec![
            SchemaField::required("id", SemanticType::Integer),
            SchemaField::nullable("id", SemanticType::String),
        ]);
        assert!(matches!(result, Err(SyncError::Configuration { .. })));
    }

    #[test]
    fn test_schema_lookup() {
        let schema = TableSchema::new(vec![
            SchemaField::required("id", SemanticType::Integer),
            SchemaField::nullable("name", SemanticType::String),
        ])
        .unwrap();

        assert_eq!(schema.len(), 2);
        assert!(schema.field("id").unwrap().required);
        assert!(schema.field("missing").is_none());
    }

    #[test]
    fn test_record_serializes_in_column_order_with_explicit_nulls() {
        let mut record = Record::with_capacity(4);
        record.push("id", RecordValue::Integer(7));
        record.push("name", RecordValue::Null);
        record.push("score", RecordValue::Float(1.5));
        record.push(
            "created_at",
            RecordValue::Temporal("2024-01-02T03:04:05+00:00".to_string()),
        );

        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"id":7,"name":null,"score":1.5,"created_at":"2024-01-02T03:04:05+00:00"}"#
        );
    }

    #[test]
    fn test_enumerate_tasks() {
        let finance = Arc::new(DataSource::new(
            "finance",
            "sqlite::memory:",
            "main",
            vec!["expense".to_string(), "income".to_string()],
        ));
        let sales = Arc::new(DataSource::new(
            "salesforce",
            "sqlite::memory:",
            "main",
            vec!["account".to_string()],
        ));

        let tasks = SyncTask::enumerate(&[finance, sales]);
        let names: Vec<String> = tasks.iter().map(SyncTask::name).collect();
        assert_eq!(
            names,
            vec!["finance.expense", "finance.income", "salesforce.account"]
        );
    }

    #[test]
    fn test_data_source_debug_redacts_password() {
        let source = DataSource::new(
            "finance",
            "mysql://app:hunter2@db:3306/finance",
            "finance",
            vec![],
        );
        let debug = format!("{source:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("app:****"));
    }

    #[test]
    fn test_semantic_type_display_matches_serde() {
        for ty in [
            SemanticType::String,
            SemanticType::Integer,
            SemanticType::Float,
            SemanticType::Date,
            SemanticType::Timestamp,
            SemanticType::Boolean,
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{ty}\""));
        }
    }
}
