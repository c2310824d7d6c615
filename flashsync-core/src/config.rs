//! Sync run configuration.
//!
//! [`SyncConfig`] is a plain struct consumed by the orchestrator. Loading it
//! from the environment is the binary's job; this module only owns defaults
//! and validation.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// RFC 3339 with a numeric offset, e.g. `2024-01-02T03:04:05+00:00`.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// A validated chrono strftime pattern applied to every temporal value.
///
/// # Example
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use flashsync_core::config::DateFormat;
///
/// let format = DateFormat::new("%Y-%m-%d %H:%M").unwrap();
/// let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
/// assert_eq!(format.format(&ts), "2024-03-01 12:30");
///
/// assert!(DateFormat::new("%Q").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DateFormat(String);

impl DateFormat {
    /// Parses and validates a strftime pattern.
    ///
    /// # Errors
    /// Returns a configuration error if the pattern is empty, contains an
    /// unknown specifier, or contains a specifier that only works for parsing.
    pub fn new(pattern: impl Into<String>) -> crate::Result<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(SyncError::configuration("date format cannot be empty"));
        }
        if StrftimeItems::new(&pattern).any(|item| matches!(item, Item::Error)) {
            return Err(SyncError::configuration(format!(
                "invalid date format '{pattern}'"
            )));
        }

        // Some specifiers parse but cannot be rendered (e.g. `%#z`)
        let mut rendered = String::new();
        if write!(
            rendered,
            "{}",
            DateTime::<Utc>::UNIX_EPOCH.format_with_items(StrftimeItems::new(&pattern))
        )
        .is_err()
        {
            return Err(SyncError::configuration(format!(
                "date format '{pattern}' cannot be used for output"
            )));
        }
        Ok(Self(pattern))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Formats a UTC timestamp with this pattern.
    pub fn format(&self, value: &DateTime<Utc>) -> String {
        let mut out = String::with_capacity(self.0.len() + 16);
        // Construction rejects patterns that fail to render, and UTC
        // timestamps carry every field a specifier can ask for.
        let _ = write!(out, "{}", value.format_with_items(StrftimeItems::new(&self.0)));
        out
    }
}

impl Default for DateFormat {
    fn default() -> Self {
        Self(DEFAULT_DATE_FORMAT.to_string())
    }
}

impl TryFrom<String> for DateFormat {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DateFormat> for String {
    fn from(value: DateFormat) -> Self {
        value.0
    }
}

impl std::str::FromStr for DateFormat {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for DateFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Destination identifiers: the project (warehouse database) and the dataset
/// (schema) tables are written into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub project_id: String,
    pub dataset_id: String,
}

/// Per-task source connection pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum number of open connections per source pool
    pub max_open: u32,
    /// Maximum number of idle connections kept by the pool
    pub max_idle: u32,
    /// Maximum connection lifetime; zero means unlimited
    pub max_lifetime: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: 10,
            max_lifetime: Duration::from_secs(60),
        }
    }
}

impl PoolSettings {
    /// Lifetime to hand to the pool, `None` when unlimited
    pub fn lifetime(&self) -> Option<Duration> {
        (!self.max_lifetime.is_zero()).then_some(self.max_lifetime)
    }
}

/// Configuration for one orchestration run.
///
/// # Example
/// ```rust
/// use flashsync_core::config::{DestinationConfig, SyncConfig};
///
/// let config = SyncConfig::new(DestinationConfig {
///     project_id: "analytics".to_string(),
///     dataset_id: "finance_raw".to_string(),
/// })
/// .with_max_concurrent_tasks(4);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub destination: DestinationConfig,
    pub pool: PoolSettings,
    /// Upper bound for the whole multi-table run
    pub run_timeout: Duration,
    pub date_format: DateFormat,
    /// Optional cap on concurrently running tasks; `None` runs every table at once
    pub max_concurrent_tasks: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            destination: DestinationConfig::default(),
            pool: PoolSettings::default(),
            run_timeout: Duration::from_secs(10 * 60),
            date_format: DateFormat::default(),
            max_concurrent_tasks: None,
        }
    }
}

impl SyncConfig {
    pub fn new(destination: DestinationConfig) -> Self {
        Self {
            destination,
            ..Default::default()
        }
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn with_date_format(mut self, date_format: DateFormat) -> Self {
        self.date_format = date_format;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, limit: usize) -> Self {
        self.max_concurrent_tasks = Some(limit);
        self
    }

    /// Validates configuration values before a run starts.
    ///
    /// # Errors
    /// Returns a configuration error describing the first invalid value.
    pub fn validate(&self) -> crate::Result<()> {
        validate_identifier("project_id", &self.destination.project_id)?;
        validate_identifier("dataset_id", &self.destination.dataset_id)?;

        if self.pool.max_open == 0 {
            return Err(SyncError::configuration(
                "max_open must be greater than 0",
            ));
        }

        if self.pool.max_idle > self.pool.max_open {
            return Err(SyncError::configuration(format!(
                "max_idle ({}) cannot exceed max_open ({})",
                self.pool.max_idle, self.pool.max_open
            )));
        }

        if self.run_timeout.is_zero() {
            return Err(SyncError::configuration(
                "run_timeout must be greater than 0",
            ));
        }

        if self.max_concurrent_tasks == Some(0) {
            return Err(SyncError::configuration(
                "max_concurrent_tasks must be greater than 0 when set",
            ));
        }

        Ok(())
    }
}

fn validate_identifier(field: &str, value: &str) -> crate::Result<()> {
    if value.trim().is_empty() {
        return Err(SyncError::configuration(format!("{field} cannot be empty")));
    }
    if value.chars().any(|c| matches!(c, '"' | '\'' | '`' | ';') || c.is_control()) {
        return Err(SyncError::configuration(format!(
            "{field} contains forbidden characters: {value}"
        )));
    }
    Ok(())
}
