//! flashsync: full-table snapshot sync into the warehouse.
//!
//! Connects to the warehouse, then runs one concurrent extract/load task per
//! catalog table. Exits non-zero when any table fails, the run times out, or
//! the process is interrupted.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use flashsync::Cli;
use flashsync_core::destination::PostgresWarehouse;
use flashsync_core::error::redact_database_url;
use flashsync_core::logging::init_logging;
use flashsync_core::{JobOrchestrator, SqlxConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_format)?;

    let config = cli.sync_config().context("Invalid configuration")?;
    let sources = cli.data_sources().context("Invalid source configuration")?;

    info!(
        warehouse = %redact_database_url(&cli.warehouse.warehouse_url),
        project = %config.destination.project_id,
        dataset = %config.destination.dataset_id,
        "Starting sync job"
    );

    let warehouse = Arc::new(
        PostgresWarehouse::connect(
            &cli.warehouse.warehouse_url,
            &config.destination.project_id,
            config.pool.max_open,
        )
        .await
        .context("Failed to create warehouse client")?,
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling sync run");
            interrupt.cancel();
        }
    });

    let orchestrator = JobOrchestrator::new(config, warehouse.clone(), Arc::new(SqlxConnector));
    let result = orchestrator.run_with_cancellation(&sources, cancel).await;
    warehouse.close().await;

    match result {
        Ok(summary) => {
            info!(
                tables = summary.tasks.len(),
                rows_extracted = summary.total_rows_extracted(),
                "Sync job finished successfully"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Sync job failed");
            Err(e).context("Sync job failed")
        }
    }
}
