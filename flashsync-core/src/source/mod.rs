//! Source database adapters.
//!
//! A [`SourceConnection`] wraps one connection pool owned by a single sync
//! task. Rows are streamed through the object-safe [`SourceRow`] trait so the
//! parser and executor never depend on a concrete driver.
//!
//! # Supported sources
//! - MySQL (`mysql` feature)
//! - SQLite (`sqlite` feature), used for local runs and tests

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::BoxStream;

use crate::config::PoolSettings;
use crate::error::{BoxError, SyncError};
use crate::models::DataSource;

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub use mysql::MySqlSource;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSource;

/// Column metadata reported by the driver for a query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    /// Native type name as reported by the driver, e.g. `VARCHAR`
    pub type_name: String,
    /// `Some(true)` when nullable, `Some(false)` when the driver asserts
    /// NOT NULL, `None` when unknown
    pub nullable: Option<bool>,
}

/// A driver-level column value before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Null,
    Bytes(Vec<u8>),
    Text(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    /// Wall-clock datetime; sessions are pinned to UTC
    DateTime(NaiveDateTime),
    Timestamp(DateTime<Utc>),
}

/// One positioned result row.
pub trait SourceRow: Send {
    fn column_count(&self) -> usize;

    fn column_name(&self, index: usize) -> &str;

    /// Reads one column value.
    ///
    /// # Errors
    /// Returns the driver's decode error when the column cannot be read.
    fn value(&self, index: usize) -> Result<SourceValue, BoxError>;
}

pub type BoxedRow = Box<dyn SourceRow>;

/// Row cursor returned by [`SourceConnection::fetch`].
pub type RowStream<'a> = BoxStream<'a, Result<BoxedRow, BoxError>>;

/// An open connection pool to one source database.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Runs the query once and reports its result columns.
    async fn describe_query(&self, query: &str) -> Result<Vec<ColumnMetadata>, BoxError>;

    /// Executes the query and streams its rows in result order.
    fn fetch<'a>(&'a self, query: &'a str) -> RowStream<'a>;

    /// Builds a `SELECT *` for one table, quoted for this dialect.
    fn select_all(&self, database: &str, table: &str) -> String;

    /// Closes the underlying pool.
    async fn close(&self);
}

/// Opens source connections for sync tasks.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Opens a dedicated pool for one task.
    ///
    /// # Errors
    /// Returns a connection error when the pool cannot be created, or a
    /// configuration error for unsupported URLs.
    async fn connect(
        &self,
        source: &DataSource,
        pool: &PoolSettings,
    ) -> crate::Result<Box<dyn SourceConnection>>;
}

/// Source engines recognized by [`SqlxConnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    MySql,
    Sqlite,
}

/// Detects the source engine from a connection URL scheme.
///
/// # Errors
/// Returns a configuration error for unrecognized schemes.
pub fn detect_source_kind(url: &str) -> crate::Result<SourceKind> {
    if url.starts_with("mysql://") {
        Ok(SourceKind::MySql)
    } else if url.starts_with("sqlite:") {
        Ok(SourceKind::Sqlite)
    } else {
        Err(SyncError::configuration(
            "Unrecognized source connection string format",
        ))
    }
}

/// Connector that dispatches on the URL scheme to the sqlx-backed adapters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxConnector;

#[async_trait]
impl SourceConnector for SqlxConnector {
    async fn connect(
        &self,
        source: &DataSource,
        pool: &PoolSettings,
    ) -> crate::Result<Box<dyn SourceConnection>> {
        match detect_source_kind(&source.url)? {
            #[cfg(feature = "mysql")]
            SourceKind::MySql => Ok(Box::new(MySqlSource::connect(&source.url, pool).await?)),
            #[cfg(not(feature = "mysql"))]
            SourceKind::MySql => Err(SyncError::configuration(
                "MySQL support not compiled in. Use --features mysql",
            )),
            #[cfg(feature = "sqlite")]
            SourceKind::Sqlite => Ok(Box::new(SqliteSource::connect(&source.url, pool).await?)),
            #[cfg(not(feature = "sqlite"))]
            SourceKind::Sqlite => Err(SyncError::configuration(
                "SQLite support not compiled in. Use --features sqlite",
            )),
        }
    }
}

/// Idle timeout used when the pool may not keep idle connections.
#[cfg(any(feature = "mysql", feature = "sqlite"))]
const IDLE_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Translates pool limits into sqlx pool options.
///
/// sqlx has no idle-connection count limit: `max_idle == 0` closes idle
/// connections almost immediately, any other value keeps sqlx's idle reaping.
#[cfg(any(feature = "mysql", feature = "sqlite"))]
pub(crate) fn pool_options<DB: sqlx::Database>(
    settings: &PoolSettings,
) -> sqlx::pool::PoolOptions<DB> {
    let options = sqlx::pool::PoolOptions::<DB>::new()
        .max_connections(settings.max_open)
        .min_connections(0)
        .max_lifetime(settings.lifetime());

    if settings.max_idle == 0 {
        options.idle_timeout(Some(IDLE_DRAIN_TIMEOUT))
    } else {
        options
    }
}

/// Quotes an identifier with the given quote character, doubling embedded quotes.
pub(crate) fn quote_identifier(name: &str, quote: char) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push(quote);
    for c in name.chars() {
        if c == quote {
            quoted.push(quote);
        }
        quoted.push(c);
    }
    quoted.push(quote);
    quoted
}
