//! Destination warehouse abstraction.
//!
//! A [`Destination`] is shared by every sync task of a run and must be safe
//! for concurrent use. Loads are asynchronous jobs: [`Destination::submit_load`]
//! returns a handle and [`Destination::wait_for_job`] blocks until the job
//! reaches a terminal state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::BoxError;
use crate::models::{SemanticType, TableSchema};

#[cfg(feature = "postgresql")]
pub mod postgres;

#[cfg(feature = "postgresql")]
pub use postgres::PostgresWarehouse;

/// Fully qualified destination table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Live metadata of an existing destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub schema: TableSchema,
    /// Version tag guarding concurrent schema updates, when supported
    pub etag: Option<String>,
}

/// Payload encodings accepted by [`Destination::submit_load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    /// One JSON object per line, no enclosing array
    NewlineDelimitedJson,
}

/// How a load treats rows already in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteDisposition {
    /// Replace the entire table contents
    Truncate,
    /// Keep existing rows
    Append,
}

/// A bulk-load request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub payload: Vec<u8>,
    pub format: SourceFormat,
    pub write_disposition: WriteDisposition,
}

impl LoadRequest {
    /// Replace-contents load of a newline-delimited JSON buffer.
    pub const fn truncate_json(payload: Vec<u8>) -> Self {
        Self {
            payload,
            format: SourceFormat::NewlineDelimitedJson,
            write_disposition: WriteDisposition::Truncate,
        }
    }
}

/// Handle to a submitted load job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadJob {
    pub id: Uuid,
    pub table: TableRef,
}

/// Terminal state of a load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Done { rows_loaded: u64 },
    Failed { message: String },
}

/// Why the destination refused an in-place schema update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaRejection {
    /// An existing column would change type
    TypeChange {
        field: String,
        from: SemanticType,
        to: SemanticType,
    },
    /// An existing column is absent from the new schema
    FieldRemoved { field: String },
    /// A new column is required and existing rows have no value for it
    RequiredFieldAdded { field: String },
}

impl std::fmt::Display for SchemaRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeChange { field, from, to } => {
                write!(f, "field '{field}' changed type from {from} to {to}")
            }
            Self::FieldRemoved { field } => write!(f, "field '{field}' is missing in new schema"),
            Self::RequiredFieldAdded { field } => {
                write!(f, "cannot add required field '{field}' to existing table")
            }
        }
    }
}

/// Errors returned by destination adapters.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("Table {table} not found")]
    NotFound { table: TableRef },

    #[error("Schema update rejected for {table}: {rejection}")]
    SchemaRejected {
        table: TableRef,
        rejection: SchemaRejection,
    },

    #[error("Destination request failed: {context}")]
    Request {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl DestinationError {
    pub fn request<E>(context: impl Into<String>, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Request {
            context: context.into(),
            source: error.into(),
        }
    }

    /// True when an in-place update was refused as an unsafe migration.
    ///
    /// Only type changes and field removals qualify; these are resolved by
    /// deleting and recreating the table.
    pub const fn is_critical_schema_error(&self) -> bool {
        matches!(
            self,
            Self::SchemaRejected {
                rejection: SchemaRejection::TypeChange { .. } | SchemaRejection::FieldRemoved { .. },
                ..
            }
        )
    }
}

/// A warehouse that can hold reconciled tables and run bulk loads.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Returns the table's live metadata, or `None` when it does not exist.
    async fn table_metadata(
        &self,
        table: &TableRef,
    ) -> Result<Option<TableMetadata>, DestinationError>;

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), DestinationError>;

    /// Updates the table schema in place.
    ///
    /// # Errors
    /// Returns [`DestinationError::SchemaRejected`] when the change cannot be
    /// applied without rewriting existing data.
    async fn update_schema(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        etag: Option<&str>,
    ) -> Result<(), DestinationError>;

    async fn delete_table(&self, table: &TableRef) -> Result<(), DestinationError>;

    async fn submit_load(
        &self,
        table: &TableRef,
        request: LoadRequest,
    ) -> Result<LoadJob, DestinationError>;

    async fn wait_for_job(&self, job: &LoadJob) -> Result<JobStatus, DestinationError>;
}
