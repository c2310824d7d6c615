//! Library module for the flashsync binary.
//!
//! Holds the CLI definition, the static source catalog and the translation
//! from arguments to a [`SyncConfig`], so they can be tested without running
//! a sync.

use std::time::Duration;

use clap::{Args, Parser};
use flashsync_core::config::{DEFAULT_DATE_FORMAT, DateFormat, DestinationConfig, PoolSettings};
use flashsync_core::logging::LogFormat;
use flashsync_core::{DataSource, SyncConfig};
use url::Url;

/// Tables synced from the Salesforce replica.
pub const SALESFORCE_TABLES: &[&str] = &["arr_sf_opportunity", "arr_sf_account"];

/// Tables synced from the finance database.
pub const FINANCE_TABLES: &[&str] = &[
    "cache_financial_acc_expense",
    "cache_financial_acc_cost_of_sales",
    "cache_financial_acc_income",
];

#[derive(Parser, Debug)]
#[command(name = "flashsync")]
#[command(about = "Sync finance and Salesforce tables into the warehouse")]
#[command(version)]
#[command(long_about = "
flashsync - full-table snapshot sync into the warehouse

Every configured table is copied in full on each run:
- the destination schema is inferred from the live source table
- the destination table is created, updated, or recreated to match
- the table contents are replaced with the freshly extracted rows

All tables sync concurrently. The first failure cancels the rest and the
process exits with a non-zero status.

Every option can also be set through the environment variable shown in
its help text.
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(flatten)]
    pub sources: SourceArgs,

    #[command(flatten)]
    pub warehouse: WarehouseArgs,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, help = "Suppress all output except errors")]
    pub quiet: bool,

    /// Log line format
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty", help = "Log format (pretty or json)")]
    pub log_format: LogFormat,
}

/// MySQL connection parameters for the two sources.
#[derive(Args, Debug)]
pub struct SourceArgs {
    #[arg(long, env = "DB_HOST", help = "MySQL host, optionally with :port")]
    pub db_host: String,

    #[arg(long, env = "FINANCE_DB_NAME")]
    pub finance_db_name: String,

    #[arg(long, env = "FINANCE_DB_USER")]
    pub finance_db_user: String,

    #[arg(long, env = "FINANCE_DB_PASSWORD", hide_env_values = true)]
    pub finance_db_password: String,

    #[arg(long, env = "SALESFORCE_DB_NAME")]
    pub salesforce_db_name: String,

    #[arg(long, env = "SALESFORCE_DB_USER")]
    pub salesforce_db_user: String,

    #[arg(long, env = "SALESFORCE_DB_PASSWORD", hide_env_values = true)]
    pub salesforce_db_password: String,
}

#[derive(Args, Debug)]
pub struct WarehouseArgs {
    #[arg(
        long,
        env = "WAREHOUSE_URL",
        hide_env_values = true,
        help = "Warehouse server URL (postgres://); credentials are redacted in logs"
    )]
    pub warehouse_url: String,

    #[arg(long, env = "GCP_PROJECT_ID", help = "Destination project (warehouse database)")]
    pub project_id: String,

    #[arg(long, env = "BQ_DATASET_ID", help = "Destination dataset (warehouse schema)")]
    pub dataset_id: String,
}

#[derive(Args, Debug)]
pub struct TuningArgs {
    #[arg(long, env = "DB_MAX_OPEN_CONNECTIONS", default_value_t = 10)]
    pub max_open_connections: u32,

    #[arg(long, env = "DB_MAX_IDLE_CONNECTIONS", default_value_t = 10)]
    pub max_idle_connections: u32,

    #[arg(
        long,
        env = "DB_CONN_MAX_LIFETIME",
        default_value = "1m",
        value_parser = parse_duration,
        help = "Maximum source connection lifetime (e.g. 90s, 10m, 1h30m; 0 = unlimited)"
    )]
    pub conn_max_lifetime: Duration,

    #[arg(
        long,
        env = "SYNC_TIMEOUT",
        default_value = "10m",
        value_parser = parse_duration,
        help = "Timeout for the whole run"
    )]
    pub sync_timeout: Duration,

    #[arg(
        long,
        env = "DATE_FORMAT",
        default_value = DEFAULT_DATE_FORMAT,
        help = "strftime pattern applied to date and datetime values"
    )]
    pub date_format: DateFormat,

    #[arg(long, env = "SYNC_MAX_CONCURRENT_TASKS", help = "Cap on tables synced at once")]
    pub max_concurrent_tasks: Option<usize>,
}

impl Cli {
    /// Builds the run configuration from the parsed arguments.
    ///
    /// # Errors
    /// Returns an error when the resulting configuration is invalid.
    pub fn sync_config(&self) -> flashsync_core::Result<SyncConfig> {
        let mut config = SyncConfig::new(DestinationConfig {
            project_id: self.warehouse.project_id.clone(),
            dataset_id: self.warehouse.dataset_id.clone(),
        })
        .with_pool(PoolSettings {
            max_open: self.tuning.max_open_connections,
            max_idle: self.tuning.max_idle_connections,
            max_lifetime: self.tuning.conn_max_lifetime,
        })
        .with_run_timeout(self.tuning.sync_timeout)
        .with_date_format(self.tuning.date_format.clone());

        if let Some(limit) = self.tuning.max_concurrent_tasks {
            config = config.with_max_concurrent_tasks(limit);
        }

        config.validate()?;
        Ok(config)
    }

    /// The static source catalog with connection URLs filled in.
    ///
    /// # Errors
    /// Returns a configuration error when the host cannot form a valid URL.
    pub fn data_sources(&self) -> flashsync_core::Result<Vec<DataSource>> {
        let args = &self.sources;
        Ok(vec![
            DataSource::new(
                "salesforce",
                mysql_url(
                    &args.db_host,
                    &args.salesforce_db_user,
                    &args.salesforce_db_password,
                    &args.salesforce_db_name,
                )?,
                args.salesforce_db_name.clone(),
                SALESFORCE_TABLES.iter().map(ToString::to_string).collect(),
            ),
            DataSource::new(
                "finance",
                mysql_url(
                    &args.db_host,
                    &args.finance_db_user,
                    &args.finance_db_password,
                    &args.finance_db_name,
                )?,
                args.finance_db_name.clone(),
                FINANCE_TABLES.iter().map(ToString::to_string).collect(),
            ),
        ])
    }
}

/// Assembles a MySQL connection URL that requires TLS.
///
/// # Errors
/// Returns a configuration error for hosts that do not form a valid URL.
pub fn mysql_url(
    host: &str,
    user: &str,
    password: &str,
    database: &str,
) -> flashsync_core::Result<String> {
    let invalid = || flashsync_core::SyncError::configuration(format!("Invalid MySQL host: {host}"));

    if host.trim().is_empty() {
        return Err(invalid());
    }
    let mut url = Url::parse(&format!("mysql://{host}")).map_err(|_| invalid())?;
    if url.host_str().is_none_or(str::is_empty) || url.path().len() > 1 {
        return Err(invalid());
    }

    url.set_username(user).map_err(|()| invalid())?;
    if !password.is_empty() {
        url.set_password(Some(password)).map_err(|()| invalid())?;
    }
    url.set_path(database);
    url.query_pairs_mut().append_pair("ssl-mode", "required");
    Ok(url.to_string())
}

/// Parses durations such as `90s`, `10m`, `1h`, `1h30m` or plain seconds.
///
/// # Errors
/// Returns a message naming the problem, suitable for clap.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("duration cannot be empty".to_string());
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            other => return Err(format!("invalid duration '{value}': unknown unit '{other}'")),
        };
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{value}': missing number before '{c}'"))?;
        total = amount
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| format!("duration '{value}' is too large"))?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(format!("invalid duration '{value}': missing unit after '{digits}'"));
    }
    Ok(Duration::from_secs(total))
}
