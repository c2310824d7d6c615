//! Concurrent multi-table sync orchestration.
//!
//! Every (source, table) pair runs as its own task on a [`JoinSet`]. All
//! tasks share one run-scoped [`CancellationToken`]: the first fatal failure,
//! the run timeout, or an external cancellation cancels it and the remaining
//! tasks abort at their next blocking step. The orchestrator always waits for
//! every task to finish before returning.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::SyncConfig;
use crate::destination::{Destination, TableRef};
use crate::error::SyncError;
use crate::executor::{ExtractJob, ExtractLoadExecutor, until_cancelled};
use crate::models::{DataSource, DestinationTableSpec, RunSummary, SyncTask, TaskReport};
use crate::parser::{DynamicRowParser, RowParser};
use crate::reconcile::TableReconciler;
use crate::schema::{infer_schema, sample_query};
use crate::source::SourceConnector;

/// Runs one extract/load task per configured table.
pub struct JobOrchestrator {
    config: SyncConfig,
    destination: Arc<dyn Destination>,
    connector: Arc<dyn SourceConnector>,
    parser: Arc<dyn RowParser>,
}

/// Everything a spawned task needs, cloned per task.
#[derive(Clone)]
struct TaskContext {
    config: Arc<SyncConfig>,
    connector: Arc<dyn SourceConnector>,
    reconciler: TableReconciler,
    executor: Arc<ExtractLoadExecutor>,
    cancel: CancellationToken,
    limiter: Option<Arc<Semaphore>>,
}

impl JobOrchestrator {
    /// Creates an orchestrator whose parser formats temporal values with
    /// `config.date_format`.
    pub fn new(
        config: SyncConfig,
        destination: Arc<dyn Destination>,
        connector: Arc<dyn SourceConnector>,
    ) -> Self {
        let parser = Arc::new(DynamicRowParser::new(config.date_format.clone()));
        Self {
            config,
            destination,
            connector,
            parser,
        }
    }

    /// Replaces the row parser.
    pub fn with_parser(mut self, parser: Arc<dyn RowParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Syncs every table of every source.
    ///
    /// # Errors
    /// Returns the first task failure (later failures are only logged), or
    /// [`SyncError::Timeout`] if the run timeout expires first.
    pub async fn run(&self, sources: &[DataSource]) -> crate::Result<RunSummary> {
        self.run_with_cancellation(sources, CancellationToken::new())
            .await
    }

    /// Like [`JobOrchestrator::run`], but also stops when `cancel` fires.
    ///
    /// # Errors
    /// See [`JobOrchestrator::run`]. An external cancellation with no prior
    /// failure is reported as [`SyncError::Cancelled`].
    pub async fn run_with_cancellation(
        &self,
        sources: &[DataSource],
        cancel: CancellationToken,
    ) -> crate::Result<RunSummary> {
        self.config.validate()?;

        let sources: Vec<Arc<DataSource>> = sources.iter().cloned().map(Arc::new).collect();
        let tasks = SyncTask::enumerate(&sources);
        tracing::info!(
            sources = sources.len(),
            tables = tasks.len(),
            timeout_secs = self.config.run_timeout.as_secs(),
            "Starting sync run"
        );

        let run_token = cancel.child_token();
        let context = TaskContext {
            config: Arc::new(self.config.clone()),
            connector: Arc::clone(&self.connector),
            reconciler: TableReconciler::new(Arc::clone(&self.destination)),
            executor: Arc::new(ExtractLoadExecutor::new(
                Arc::clone(&self.destination),
                Arc::clone(&self.parser),
                run_token.clone(),
            )),
            cancel: run_token.clone(),
            limiter: self
                .config
                .max_concurrent_tasks
                .map(|limit| Arc::new(Semaphore::new(limit))),
        };

        let mut set = JoinSet::new();
        let mut names = HashMap::with_capacity(tasks.len());
        for task in tasks {
            let name = task.name();
            let span = tracing::info_span!(
                "sync_task",
                source = %task.source.name,
                table = %task.table
            );
            let handle = set.spawn(run_task(context.clone(), task).instrument(span));
            names.insert(handle.id(), name);
        }

        let deadline = tokio::time::sleep(self.config.run_timeout);
        tokio::pin!(deadline);
        let mut deadline_passed = false;
        let mut first_error: Option<SyncError> = None;
        let mut reports = Vec::with_capacity(names.len());

        loop {
            let joined = tokio::select! {
                joined = set.join_next_with_id() => joined,
                () = &mut deadline, if !deadline_passed => {
                    deadline_passed = true;
                    tracing::error!(
                        timeout_secs = self.config.run_timeout.as_secs(),
                        "Sync run timed out, cancelling remaining tasks"
                    );
                    record_failure(
                        &mut first_error,
                        &run_token,
                        SyncError::Timeout {
                            timeout_secs: self.config.run_timeout.as_secs(),
                        },
                    );
                    continue;
                }
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((_, Ok(report))) => {
                    tracing::info!(
                        source = %report.source,
                        table = %report.table,
                        action = %report.action,
                        rows_extracted = report.outcome.rows_extracted,
                        rows_skipped = report.outcome.rows_skipped,
                        loaded = report.outcome.loaded(),
                        "Task succeeded"
                    );
                    reports.push(report);
                }
                Ok((id, Err(e))) => {
                    let task = names.get(&id).map_or("<unknown>", String::as_str);
                    if e.is_cancellation() {
                        tracing::warn!(task, error = %e, "Task cancelled");
                    } else {
                        tracing::error!(task, error = %e, "Task failed");
                    }
                    record_failure(&mut first_error, &run_token, e);
                }
                Err(join_error) => {
                    let task = names
                        .get(&join_error.id())
                        .cloned()
                        .unwrap_or_else(|| "<unknown>".to_string());
                    tracing::error!(task = %task, error = %join_error, "Task terminated abnormally");
                    record_failure(
                        &mut first_error,
                        &run_token,
                        SyncError::TaskPanicked {
                            task,
                            message: join_error.to_string(),
                        },
                    );
                }
            }
        }

        if let Some(e) = first_error {
            tracing::error!(
                succeeded = reports.len(),
                total = names.len(),
                error = %e,
                "Sync run failed"
            );
            return Err(e);
        }

        let summary = RunSummary { tasks: reports };
        tracing::info!(
            tables = summary.tasks.len(),
            tables_loaded = summary.tables_loaded(),
            rows_extracted = summary.total_rows_extracted(),
            rows_skipped = summary.total_rows_skipped(),
            "Sync run completed successfully"
        );
        Ok(summary)
    }
}

/// Keeps the first failure and cancels the run when it is recorded.
fn record_failure(first: &mut Option<SyncError>, run_token: &CancellationToken, error: SyncError) {
    if first.is_none() {
        *first = Some(error);
        run_token.cancel();
    }
}

async fn run_task(ctx: TaskContext, task: SyncTask) -> crate::Result<TaskReport> {
    let _permit = match &ctx.limiter {
        Some(limiter) => Some(
            until_cancelled(&ctx.cancel, "waiting for a task slot", async {
                Arc::clone(limiter)
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::cancelled("waiting for a task slot"))
            })
            .await?,
        ),
        None => None,
    };

    tracing::info!("Starting sync task");
    let source = until_cancelled(
        &ctx.cancel,
        "source connection",
        ctx.connector.connect(&task.source, &ctx.config.pool),
    )
    .await?;

    let result = async {
        let query = source.select_all(&task.source.database, &task.table);
        let schema = until_cancelled(
            &ctx.cancel,
            "schema inference",
            infer_schema(source.as_ref(), &sample_query(&query)),
        )
        .await?;

        let spec = DestinationTableSpec {
            table: task.table.clone(),
            schema,
        };
        let table = TableRef::new(
            &ctx.config.destination.project_id,
            &ctx.config.destination.dataset_id,
            &spec.table,
        );
        let action = until_cancelled(
            &ctx.cancel,
            "table reconciliation",
            ctx.reconciler.reconcile(&table, &spec),
        )
        .await?;

        let job = ExtractJob {
            name: task.name(),
            query,
            table,
        };
        let outcome = ctx.executor.execute(source.as_ref(), &job).await?;

        Ok(TaskReport {
            source: task.source.name.clone(),
            table: task.table.clone(),
            action,
            outcome,
        })
    }
    .await;

    source.close().await;
    result
}
