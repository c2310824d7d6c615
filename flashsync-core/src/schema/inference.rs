//! Destination schema inference from live query metadata.

use crate::error::SyncError;
use crate::models::{SchemaField, TableSchema};
use crate::schema::type_mapping::lookup_native_type;
use crate::source::SourceConnection;

/// Bounds an extraction query to a single row for inference.
///
/// # Example
/// ```rust
/// use flashsync_core::schema::sample_query;
///
/// assert_eq!(sample_query("SELECT * FROM `db`.`t`"), "SELECT * FROM `db`.`t` LIMIT 1");
/// ```
pub fn sample_query(query: &str) -> String {
    format!("{} LIMIT 1", query.trim_end().trim_end_matches(';'))
}

/// Derives a table schema from a source query's column metadata.
///
/// The bounded query is executed once. Unknown native types map to STRING
/// and are logged. A column is marked required only when the driver asserts
/// it is non-nullable.
///
/// # Errors
/// Returns [`SyncError::SchemaInference`] if the query fails, no column
/// metadata is available, or column names are not unique.
pub async fn infer_schema(
    source: &dyn SourceConnection,
    sample_query: &str,
) -> crate::Result<TableSchema> {
    let columns = source
        .describe_query(sample_query)
        .await
        .map_err(|e| SyncError::inference_failed("Failed to run sample query", e))?;

    if columns.is_empty() {
        return Err(SyncError::SchemaInference {
            context: "Sample query returned no column metadata".to_string(),
            source: None,
        });
    }

    let mut fields = Vec::with_capacity(columns.len());
    for column in columns {
        let field_type = lookup_native_type(&column.type_name).unwrap_or_else(|| {
            tracing::warn!(
                column = %column.name,
                native_type = %column.type_name,
                "Unknown column type, defaulting to STRING"
            );
            crate::models::SemanticType::String
        });
        let required = column.nullable == Some(false);

        tracing::debug!(
            column = %column.name,
            native_type = %column.type_name,
            field_type = %field_type,
            required,
            "Mapped column"
        );

        fields.push(SchemaField {
            name: column.name,
            field_type,
            required,
        });
    }

    let schema = TableSchema::new(fields)
        .map_err(|e| SyncError::inference_failed("Invalid inferred schema", e))?;
    tracing::info!(fields = schema.len(), "Inferred schema");
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::models::SemanticType;
    use crate::source::{ColumnMetadata, RowStream};
    use async_trait::async_trait;
    use futures::StreamExt;

    struct DescribeOnly(Result<Vec<ColumnMetadata>, &'static str>);

    #[async_trait]
    impl SourceConnection for DescribeOnly {
        async fn describe_query(&self, _query: &str) -> Result<Vec<ColumnMetadata>, BoxError> {
            self.0.clone().map_err(BoxError::from)
        }

        fn fetch<'a>(&'a self, _query: &'a str) -> RowStream<'a> {
            futures::stream::empty().boxed()
        }

        fn select_all(&self, database: &str, table: &str) -> String {
            format!("SELECT * FROM {database}.{table}")
        }

        async fn close(&self) {}
    }

    fn column(name: &str, type_name: &str, nullable: Option<bool>) -> ColumnMetadata {
        ColumnMetadata {
            name: name.to_string(),
            type_name: type_name.to_string(),
            nullable,
        }
    }

    #[tokio::test]
    async fn test_infers_types_and_required_flags() {
        let source = DescribeOnly(Ok(vec![
            column("id", "INT", Some(false)),
            column("name", "VARCHAR(50)", Some(true)),
            column("created_at", "DATETIME", None),
            column("is_active", "BOOLEAN", Some(true)),
            column("shape", "GEOMETRY", Some(false)),
        ]));

        let schema = infer_schema(&source, "SELECT 1").await.unwrap();
        let fields = schema.fields();

        assert_eq!(fields[0], SchemaField::required("id", SemanticType::Integer));
        assert_eq!(fields[1], SchemaField::nullable("name", SemanticType::String));
        assert_eq!(
            fields[2],
            SchemaField::nullable("created_at", SemanticType::Timestamp)
        );
        assert_eq!(
            fields[3],
            SchemaField::nullable("is_active", SemanticType::Boolean)
        );
        assert_eq!(fields[4], SchemaField::required("shape", SemanticType::String));
    }

    #[tokio::test]
    async fn test_query_failure_is_inference_error() {
        let source = DescribeOnly(Err("table does not exist"));
        let err = infer_schema(&source, "SELECT 1").await.unwrap_err();
        assert!(matches!(err, SyncError::SchemaInference { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_columns_are_rejected() {
        let source = DescribeOnly(Ok(vec![
            column("id", "INT", Some(false)),
            column("id", "INT", Some(false)),
        ]));
        let err = infer_schema(&source, "SELECT 1").await.unwrap_err();
        assert!(matches!(err, SyncError::SchemaInference { .. }));
    }

    #[tokio::test]
    async fn test_empty_metadata_is_rejected() {
        let source = DescribeOnly(Ok(vec![]));
        assert!(infer_schema(&source, "SELECT 1").await.is_err());
    }

    #[test]
    fn test_sample_query_strips_terminator() {
        assert_eq!(sample_query("SELECT * FROM t;"), "SELECT * FROM t LIMIT 1");
    }
}
