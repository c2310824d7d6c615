//! Extract/load execution for one table.
//!
//! The whole result set is materialized as newline-delimited JSON in memory
//! before the load is submitted. Every blocking step observes the run-scoped
//! cancellation token.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::destination::{Destination, JobStatus, LoadRequest, TableRef};
use crate::error::SyncError;
use crate::models::SyncOutcome;
use crate::parser::RowParser;
use crate::source::SourceConnection;

/// One extraction query and the table it loads into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractJob {
    pub name: String,
    pub query: String,
    pub table: TableRef,
}

/// Awaits `future` unless `token` is cancelled first.
///
/// # Errors
/// Returns [`SyncError::Cancelled`] naming `operation` when cancelled.
pub async fn until_cancelled<T, F>(
    token: &CancellationToken,
    operation: &str,
    future: F,
) -> crate::Result<T>
where
    F: Future<Output = crate::Result<T>>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(SyncError::cancelled(operation)),
        result = future => result,
    }
}

/// Runs query, parse, buffer and bulk-load for one table.
pub struct ExtractLoadExecutor {
    destination: Arc<dyn Destination>,
    parser: Arc<dyn RowParser>,
    cancel: CancellationToken,
}

impl ExtractLoadExecutor {
    pub fn new(
        destination: Arc<dyn Destination>,
        parser: Arc<dyn RowParser>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            destination,
            parser,
            cancel,
        }
    }

    /// Executes one full extract/load cycle.
    ///
    /// Rows that cannot be read are logged, counted and skipped. When no row
    /// is extracted the destination is not touched at all.
    ///
    /// # Errors
    /// - [`SyncError::Extraction`] if the query or the row cursor fails
    /// - [`SyncError::Serialization`] if a parsed record cannot be encoded
    /// - [`SyncError::Load`] if submission, waiting, or the job itself fails
    /// - [`SyncError::Cancelled`] if the run is cancelled at a blocking step
    pub async fn execute(
        &self,
        source: &dyn SourceConnection,
        job: &ExtractJob,
    ) -> crate::Result<SyncOutcome> {
        tracing::info!(job = %job.name, "Executing query");

        let mut rows = source.fetch(&job.query);
        let mut buffer: Vec<u8> = Vec::new();
        let mut outcome = SyncOutcome::default();
        let mut row_number: u64 = 0;

        tracing::debug!("Starting data extraction to in-memory buffer");
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(SyncError::cancelled("row iteration")),
                next = rows.next() => next,
            };
            let Some(row) = next else {
                break;
            };
            let row = row.map_err(|e| {
                tracing::error!(error = %e, "Error during row iteration");
                SyncError::extraction_failed(format!("Query for {} failed", job.name), e)
            })?;
            row_number += 1;

            let record = match self.parser.parse(row.as_ref()) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(row_number, error = %e, "Failed to parse row, skipping");
                    outcome.rows_skipped += 1;
                    continue;
                }
            };

            serde_json::to_writer(&mut buffer, &record).map_err(|source| {
                tracing::error!(row_number, error = %source, "Failed to write row to memory buffer");
                SyncError::Serialization {
                    context: format!("row {row_number} of {}", job.name),
                    source,
                }
            })?;
            buffer.push(b'\n');
            outcome.rows_extracted += 1;
        }
        drop(rows);

        tracing::info!(
            rows_extracted = outcome.rows_extracted,
            rows_skipped = outcome.rows_skipped,
            "Extraction complete"
        );
        if outcome.rows_skipped > 0 {
            tracing::warn!(
                skipped_rows = outcome.rows_skipped,
                "Some rows were skipped during parsing"
            );
        }

        if outcome.rows_extracted == 0 {
            tracing::info!("No rows to load. Job finished.");
            return Ok(outcome);
        }

        outcome.rows_loaded = Some(self.load(&job.table, buffer).await?);
        Ok(outcome)
    }

    async fn load(&self, table: &TableRef, buffer: Vec<u8>) -> crate::Result<u64> {
        tracing::info!(table = %table, bytes = buffer.len(), "Starting load job");

        let load_job = until_cancelled(&self.cancel, "load submission", async {
            self.destination
                .submit_load(table, LoadRequest::truncate_json(buffer))
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to create load job");
                    SyncError::load_failed(format!("Failed to create load job for {table}"), e)
                })
        })
        .await?;
        tracing::debug!(job_id = %load_job.id, "Load job submitted");

        let status = until_cancelled(&self.cancel, "load completion wait", async {
            self.destination.wait_for_job(&load_job).await.map_err(|e| {
                tracing::error!(job_id = %load_job.id, error = %e, "Failed to wait for load job to complete");
                SyncError::load_failed(format!("Failed to wait for load job {}", load_job.id), e)
            })
        })
        .await?;

        match status {
            JobStatus::Done { rows_loaded } => {
                tracing::info!(table = %table, rows_loaded, "Load job completed successfully");
                Ok(rows_loaded)
            }
            JobStatus::Failed { message } => {
                tracing::error!(job_id = %load_job.id, error = %message, "Load job failed");
                Err(SyncError::Load {
                    context: format!("Load job {} for {table} failed: {message}", load_job.id),
                    source: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_until_cancelled_passes_result_through() {
        let token = CancellationToken::new();
        let value = until_cancelled(&token, "noop", async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_until_cancelled_prefers_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result: crate::Result<()> =
            until_cancelled(&token, "query execution", std::future::pending()).await;
        assert!(matches!(
            result,
            Err(SyncError::Cancelled { ref operation }) if operation == "query execution"
        ));
    }
}
