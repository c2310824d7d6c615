//! SQLite source adapter.
//!
//! SQLite stores values by storage class rather than by declared column type,
//! so decoding looks at the runtime storage class and only uses the declared
//! type to recognize booleans and date/time columns.
//!
//! # Connection Modes
//! - File-based: `sqlite:///path/to/database.db` or `sqlite://./relative.db`
//! - In-memory: `sqlite::memory:`

use std::str::FromStr;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};

use super::{
    BoxedRow, ColumnMetadata, RowStream, SourceConnection, SourceRow, SourceValue, pool_options,
    quote_identifier,
};
use crate::config::PoolSettings;
use crate::error::{BoxError, SyncError, redact_database_url};
use crate::models::SemanticType;
use crate::schema::lookup_native_type;

/// Logical database name SQLite uses for the primary attached file.
pub const MAIN_DATABASE: &str = "main";

/// A SQLite connection pool owned by one sync task.
pub struct SqliteSource {
    pool: SqlitePool,
}

impl SqliteSource {
    /// Opens a read-only pool against the given `sqlite:` URL.
    ///
    /// # Errors
    /// Returns a configuration error for malformed URLs and a connection
    /// error when the database cannot be opened.
    pub async fn connect(url: &str, settings: &PoolSettings) -> crate::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| {
                SyncError::configuration(format!("Invalid SQLite connection string format: {e}"))
            })?
            .read_only(!url.contains(":memory:"));

        let pool = pool_options::<sqlx::Sqlite>(settings)
            .connect_with(options)
            .await
            .map_err(|e| {
                SyncError::connection_failed(
                    format!("Failed to open SQLite database {}", redact_database_url(url)),
                    e,
                )
            })?;

        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceConnection for SqliteSource {
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
                row.map(|row| Box::new(SqliteSourceRow(row)) as BoxedRow)
                    .map_err(BoxError::from)
            })
            .boxed()
    }

    fn select_all(&self, database: &str, table: &str) -> String {
        format!(
            "SELECT * FROM {}.{}",
            quote_identifier(database, '"'),
            quote_identifier(table, '"')
        )
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct SqliteSourceRow(SqliteRow);

impl SourceRow for SqliteSourceRow {
    fn column_count(&self) -> usize {
        self.0.columns().len()
    }

    fn column_name(&self, index: usize) -> &str {
        self.0.columns().get(index).map_or("", |c| c.name())
    }

    fn value(&self, index: usize) -> Result<SourceValue, BoxError> {
        let row = &self.0;
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(SourceValue::Null);
        }
        let storage = raw.type_info().name().to_string();

        let declared = row
            .columns()
            .get(index)
            .map(|c| c.type_info().name().to_string())
            .unwrap_or_default();

        let value = match lookup_native_type(&declared) {
            Some(SemanticType::Boolean) => SourceValue::Bool(row.try_get_unchecked::<bool, _>(index)?),
            Some(SemanticType::Date) => SourceValue::Date(row.try_get::<chrono::NaiveDate, _>(index)?),
            Some(SemanticType::Timestamp) => {
                SourceValue::DateTime(row.try_get::<chrono::NaiveDateTime, _>(index)?)
            }
            _ => match storage.as_str() {
                "INTEGER" => SourceValue::Int(row.try_get_unchecked::<i64, _>(index)?),
                "REAL" => SourceValue::Float(row.try_get_unchecked::<f64, _>(index)?),
                "BLOB" => SourceValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?),
                _ => SourceValue::Text(row.try_get_unchecked::<String, _>(index)?),
            },
        };
        Ok(value)
    }
}
