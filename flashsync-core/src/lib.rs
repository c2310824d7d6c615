//! Core library for flashsync.
//!
//! flashsync copies full tables from relational sources into a warehouse.
//! For each configured table it infers a destination schema from a live
//! sample query, reconciles the destination table against it, extracts every
//! row into an in-memory newline-delimited JSON buffer and loads the buffer
//! with replace-contents semantics. All tables of a run sync concurrently and
//! the first failure cancels the rest.
//!
//! # Guarantees
//! - Each successful load fully replaces the table; an aborted load leaves the
//!   previous contents in place
//! - Source sessions are read-only
//! - Connection strings are redacted before reaching logs or errors
//!
//! # Architecture
//! - [`source`]: sqlx-backed source adapters behind the `SourceConnection` trait
//! - [`schema`]: type mapping, schema inference and comparison
//! - [`reconcile`]: create / no-op / update / destructive recreate
//! - [`parser`] and [`executor`]: row normalization and extract/load
//! - [`orchestrator`]: concurrent fan-out with fail-fast cancellation

pub mod config;
pub mod destination;
pub mod error;
pub mod executor;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod reconcile;
pub mod schema;
pub mod source;

// Re-export commonly used types
pub use config::{DateFormat, DestinationConfig, PoolSettings, SyncConfig};
pub use destination::{
    Destination, DestinationError, JobStatus, LoadJob, LoadRequest, SchemaRejection,
    TableMetadata, TableRef,
};
pub use error::{Result, RowParseError, SyncError};
pub use executor::{ExtractJob, ExtractLoadExecutor};
pub use models::{
    DataSource, DestinationTableSpec, ReconcileAction, Record, RecordValue, RunSummary,
    SchemaField, SemanticType, SyncOutcome, SyncTask, TableSchema, TaskReport,
};
pub use orchestrator::JobOrchestrator;
pub use parser::{DynamicRowParser, RowParser};
pub use reconcile::TableReconciler;
pub use source::{SourceConnection, SourceConnector, SqlxConnector};
