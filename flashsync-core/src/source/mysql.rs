//! MySQL source adapter.
//!
//! Every session is pinned to UTC and to read-only transactions. Extraction
//! runs over the text protocol, so values are decoded from their textual form
//! according to the column type reported in the result set metadata.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use url::Url;

use super::{
    BoxedRow, ColumnMetadata, RowStream, SourceConnection, SourceRow, SourceValue, pool_options,
    quote_identifier,
};
use crate::config::PoolSettings;
use crate::error::{BoxError, SyncError, redact_database_url};
use crate::models::SemanticType;
use crate::schema::{lookup_native_type, normalize_type_name};

/// A MySQL connection pool owned by one sync task.
pub struct MySqlSource {
    pool: MySqlPool,
}

impl MySqlSource {
    /// Opens a pool against the given `mysql://` URL.
    ///
    /// # Errors
    /// Returns a configuration error for malformed URLs and a connection
    /// error when the first connection cannot be established.
    pub async fn connect(url: &str, settings: &PoolSettings) -> crate::Result<Self> {
        validate_mysql_url(url)?;

        let pool = pool_options::<sqlx::MySql>(settings)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // Naive DATETIME/TIMESTAMP values are read as UTC
                    conn.execute("SET time_zone = '+00:00'").await?;
                    conn.execute("SET SESSION TRANSACTION READ ONLY").await?;
                    Ok(())
                })
            })
            .connect(url)
            .await
            .map_err(|e| {
                SyncError::connection_failed(
                    format!("Failed to connect to MySQL at {}", redact_database_url(url)),
                    e,
                )
            })?;

        tracing::debug!(url = %redact_database_url(url), "Opened MySQL source pool");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

/// Validates that a connection string is a `mysql://` URL with a host.
///
/// # Errors
/// Returns a configuration error describing the problem.
pub fn validate_mysql_url(url: &str) -> crate::Result<()> {
    let parsed = Url::parse(url).map_err(|e| {
        SyncError::configuration(format!("Invalid MySQL connection string format: {e}"))
    })?;

    if parsed.scheme() != "mysql" {
        return Err(SyncError::configuration(
            "Connection string must use mysql:// scheme",
        ));
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(SyncError::configuration(
            "Connection string must specify a host",
        ));
    }

    Ok(())
}

#[async_trait]
impl SourceConnection for MySqlSource {
    async fn describe_query(&self, query: &str) -> Result<Vec<ColumnMetadata>, BoxError> {
        sqlx::raw_sql(query).fetch_optional(&self.pool).await?;

        let described = (&self.pool).describe(query).await?;
        Ok(described
            .columns()
            .iter()
            .enumerate()
            .map(|(i, column)| ColumnMetadata {
                name: column.name().to_string(),
                type_name: column.type_info().name().to_string(),
                nullable: described.nullable(i),
            })
            .collect())
    }

    fn fetch<'a>(&'a self, query: &'a str) -> RowStream<'a> {
        sqlx::raw_sql(query)
            .fetch(&self.pool)
            .map(|row| {
                row.map(|row| Box::new(MySqlSourceRow(row)) as BoxedRow)
                    .map_err(BoxError::from)
            })
            .boxed()
    }

    fn select_all(&self, database: &str, table: &str) -> String {
        format!(
            "SELECT * FROM {}.{}",
            quote_identifier(database, '`'),
            quote_identifier(table, '`')
        )
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct MySqlSourceRow(MySqlRow);

impl SourceRow for MySqlSourceRow {
    fn column_count(&self) -> usize {
        self.0.columns().len()
    }

    fn column_name(&self, index: usize) -> &str {
        self.0.columns().get(index).map_or("", |c| c.name())
    }

    fn value(&self, index: usize) -> Result<SourceValue, BoxError> {
        let row = &self.0;
        if row.try_get_raw(index)?.is_null() {
            return Ok(SourceValue::Null);
        }

        let type_name = row
            .columns()
            .get(index)
            .map(|c| c.type_info().name().to_uppercase())
            .unwrap_or_default();

        let value = match lookup_native_type(&type_name) {
            Some(SemanticType::Integer) if type_name.contains("UNSIGNED") => {
                SourceValue::UInt(row.try_get_unchecked::<u64, _>(index)?)
            }
            Some(SemanticType::Integer) => SourceValue::Int(row.try_get_unchecked::<i64, _>(index)?),
            Some(SemanticType::Float) if is_binary_float(&type_name) => {
                SourceValue::Float(row.try_get_unchecked::<f64, _>(index)?)
            }
            Some(SemanticType::Boolean) => SourceValue::Bool(row.try_get_unchecked::<bool, _>(index)?),
            Some(SemanticType::Date) => {
                SourceValue::Date(row.try_get_unchecked::<chrono::NaiveDate, _>(index)?)
            }
            Some(SemanticType::Timestamp) => {
                SourceValue::DateTime(row.try_get_unchecked::<chrono::NaiveDateTime, _>(index)?)
            }
            // DECIMAL keeps its exact textual form; everything else arrives as bytes
            _ => SourceValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?),
        };
        Ok(value)
    }
}

fn is_binary_float(type_name: &str) -> bool {
    matches!(
        normalize_type_name(type_name).as_str(),
        "FLOAT" | "DOUBLE" | "DOUBLE PRECISION" | "REAL"
    )
}
