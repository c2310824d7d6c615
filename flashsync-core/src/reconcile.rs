//! Destination table reconciliation.
//!
//! Brings a destination table to an inferred schema in one pass:
//!
//! 1. absent: create it
//! 2. present with a matching schema: leave it alone
//! 3. present with a different schema: update in place; if the destination
//!    refuses the update as an unsafe migration, delete and recreate the table
//!
//! Recreating discards every row in the table. This is acceptable because the
//! following load truncates and repopulates the table anyway.

use std::sync::Arc;

use crate::destination::{Destination, TableRef};
use crate::error::SyncError;
use crate::models::{DestinationTableSpec, ReconcileAction};
use crate::schema::schemas_match;

/// Ensures destination tables match freshly inferred schemas.
#[derive(Clone)]
pub struct TableReconciler {
    destination: Arc<dyn Destination>,
}

impl TableReconciler {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self { destination }
    }

    /// Makes `table` exist with the schema in `spec`.
    ///
    /// # Errors
    /// Returns [`SyncError::Reconciliation`] when metadata cannot be read, the
    /// table cannot be created, a non-critical update fails, or a destructive
    /// recreate fails.
    pub async fn reconcile(
        &self,
        table: &TableRef,
        spec: &DestinationTableSpec,
    ) -> crate::Result<ReconcileAction> {
        let metadata = self
            .destination
            .table_metadata(table)
            .await
            .map_err(|e| {
                SyncError::reconciliation_failed(format!("Failed to read metadata of {table}"), e)
            })?;

        let Some(metadata) = metadata else {
            tracing::info!(table = %table, "Table not found, creating");
            self.create(table, spec).await?;
            tracing::info!(table = %table, fields = spec.schema.len(), "Table created");
            return Ok(ReconcileAction::Created);
        };

        if schemas_match(&metadata.schema, &spec.schema) {
            tracing::info!(table = %table, "Table schema is up to date");
            return Ok(ReconcileAction::Unchanged);
        }

        tracing::info!(table = %table, "Table schema differs, updating");
        match self
            .destination
            .update_schema(table, &spec.schema, metadata.etag.as_deref())
            .await
        {
            Ok(()) => {
                tracing::info!(table = %table, "Table schema updated");
                Ok(ReconcileAction::Updated)
            }
            Err(e) if e.is_critical_schema_error() => {
                tracing::error!(table = %table, error = %e, "Critical schema change, recreating table");
                tracing::warn!(
                    table = %table,
                    "WARNING: Recreating table will DELETE ALL EXISTING DATA"
                );
                self.recreate(table, spec).await?;
                tracing::info!(table = %table, "Table recreated with new schema");
                Ok(ReconcileAction::Recreated)
            }
            Err(e) => Err(SyncError::reconciliation_failed(
                format!("Failed to update schema of {table}"),
                e,
            )),
        }
    }

    async fn create(&self, table: &TableRef, spec: &DestinationTableSpec) -> crate::Result<()> {
        self.destination
            .create_table(table, &spec.schema)
            .await
            .map_err(|e| SyncError::reconciliation_failed(format!("Failed to create {table}"), e))
    }

    async fn recreate(&self, table: &TableRef, spec: &DestinationTableSpec) -> crate::Result<()> {
        self.destination.delete_table(table).await.map_err(|e| {
            SyncError::reconciliation_failed(format!("Failed to delete {table} for recreation"), e)
        })?;
        self.create(table, spec).await
    }
}
