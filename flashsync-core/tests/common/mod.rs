//! In-memory test doubles for sources and the destination.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flashsync_core::destination::{
    Destination, DestinationError, JobStatus, LoadJob, LoadRequest, SchemaRejection,
    TableMetadata, TableRef, WriteDisposition,
};
use flashsync_core::error::BoxError;
use flashsync_core::models::{DataSource, SchemaField, SemanticType, TableSchema};
use flashsync_core::source::{
    BoxedRow, ColumnMetadata, RowStream, SourceConnection, SourceConnector, SourceRow,
    SourceValue,
};
use flashsync_core::{PoolSettings, SyncError};
use futures::StreamExt;
use uuid::Uuid;

pub const PROJECT: &str = "analytics";
pub const DATASET: &str = "raw";

pub fn table_ref(table: &str) -> TableRef {
    TableRef::new(PROJECT, DATASET, table)
}

pub fn column(name: &str, type_name: &str, nullable: Option<bool>) -> ColumnMetadata {
    ColumnMetadata {
        name: name.to_string(),
        type_name: type_name.to_string(),
        nullable,
    }
}

pub fn schema(fields: Vec<SchemaField>) -> TableSchema {
    TableSchema::new(fields).unwrap()
}

// =============================================================================
// Source doubles
// =============================================================================

/// One scripted row: either readable values or a driver-level read failure.
#[derive(Debug, Clone)]
pub enum ScriptedRow {
    Values(Vec<SourceValue>),
    Unreadable(String),
}

#[derive(Debug, Clone)]
struct FakeRow {
    columns: Arc<Vec<String>>,
    row: ScriptedRow,
}

impl SourceRow for FakeRow {
    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_name(&self, index: usize) -> &str {
        &self.columns[index]
    }

    fn value(&self, index: usize) -> Result<SourceValue, BoxError> {
        match &self.row {
            ScriptedRow::Values(values) => Ok(values[index].clone()),
            ScriptedRow::Unreadable(reason) if index == 0 => Err(reason.clone().into()),
            ScriptedRow::Unreadable(_) => Ok(SourceValue::Null),
        }
    }
}

/// Script for one fake source table.
#[derive(Debug, Clone, Default)]
pub struct TableScript {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<ScriptedRow>,
    /// Fail the row cursor after this many rows
    pub cursor_error_after: Option<usize>,
    pub describe_error: Option<String>,
    /// Delay before each row is produced
    pub row_delay: Option<Duration>,
}

impl TableScript {
    pub fn new(columns: Vec<ColumnMetadata>, rows: Vec<ScriptedRow>) -> Self {
        Self {
            columns,
            rows,
            ..Default::default()
        }
    }
}

/// Counts open source handles across tasks.
#[derive(Debug, Default)]
pub struct HandleTracker {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl HandleTracker {
    fn open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A source whose tables are scripted in memory.
pub struct FakeSource {
    tables: HashMap<String, TableScript>,
    tracker: Arc<HandleTracker>,
}

impl FakeSource {
    pub fn new(tables: HashMap<String, TableScript>) -> Self {
        let tracker = Arc::new(HandleTracker::default());
        tracker.open();
        Self { tables, tracker }
    }

    pub fn single(table: &str, script: TableScript) -> Self {
        Self::new(HashMap::from([(table.to_string(), script)]))
    }

    /// Queries look like `SELECT * FROM db.table` with an optional `LIMIT 1`.
    fn script_for(&self, query: &str) -> Option<&TableScript> {
        let target = query
            .trim_start_matches("SELECT * FROM ")
            .trim_end_matches(" LIMIT 1");
        let table = target.rsplit('.').next()?;
        self.tables.get(table)
    }
}

#[async_trait]
impl SourceConnection for FakeSource {
    async fn describe_query(&self, query: &str) -> Result<Vec<ColumnMetadata>, BoxError> {
        let script = self
            .script_for(query)
            .ok_or_else(|| BoxError::from(format!("table not found: {query}")))?;
        match &script.describe_error {
            Some(message) => Err(message.clone().into()),
            None => Ok(script.columns.clone()),
        }
    }

    fn fetch<'a>(&'a self, query: &'a str) -> RowStream<'a> {
        let Some(script) = self.script_for(query).cloned() else {
            let error: BoxError = format!("table not found: {query}").into();
            return futures::stream::once(async move { Err(error) }).boxed();
        };

        let columns = Arc::new(script.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>());
        let delay = script.row_delay;
        let fail_after = script.cursor_error_after;

        let rows = script.rows.into_iter().enumerate().map(move |(i, row)| {
            if fail_after == Some(i) {
                Err(BoxError::from("connection reset by peer"))
            } else {
                Ok(Box::new(FakeRow {
                    columns: Arc::clone(&columns),
                    row,
                }) as BoxedRow)
            }
        });

        futures::stream::iter(rows)
            .then(move |row| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                row
            })
            .scan(false, |failed, row| {
                // The cursor ends after its first error
                if *failed {
                    return futures::future::ready(None);
                }
                *failed = row.is_err();
                futures::future::ready(Some(row))
            })
            .boxed()
    }

    fn select_all(&self, database: &str, table: &str) -> String {
        format!("SELECT * FROM {database}.{table}")
    }

    async fn close(&self) {
        self.tracker.close();
    }
}

/// Connector handing out fake sources by source name.
#[derive(Default)]
pub struct FakeConnector {
    sources: HashMap<String, HashMap<String, TableScript>>,
    pub tracker: Arc<HandleTracker>,
    pub failing_sources: Vec<String>,
}

impl FakeConnector {
    pub fn with_table(mut self, source: &str, table: &str, script: TableScript) -> Self {
        self.sources
            .entry(source.to_string())
            .or_default()
            .insert(table.to_string(), script);
        self
    }

    pub fn failing(mut self, source: &str) -> Self {
        self.failing_sources.push(source.to_string());
        self
    }

    /// Data sources matching every scripted table.
    pub fn data_sources(&self) -> Vec<DataSource> {
        let mut names: Vec<&String> = self.sources.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let mut tables: Vec<String> = self.sources[name].keys().cloned().collect();
                tables.sort();
                DataSource::new(name.clone(), "sqlite::memory:", name.clone(), tables)
            })
            .collect()
    }
}

#[async_trait]
impl SourceConnector for FakeConnector {
    async fn connect(
        &self,
        source: &DataSource,
        _pool: &PoolSettings,
    ) -> flashsync_core::Result<Box<dyn SourceConnection>> {
        if self.failing_sources.contains(&source.name) {
            return Err(SyncError::connection_failed(
                format!("Failed to connect to {}", source.name),
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            ));
        }
        let tables = self.sources.get(&source.name).cloned().unwrap_or_default();
        self.tracker.open();
        Ok(Box::new(FakeSource {
            tables,
            tracker: Arc::clone(&self.tracker),
        }))
    }
}

// =============================================================================
// Destination double
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateBehavior {
    /// Apply the new schema
    Apply,
    /// Refuse with a type-change rejection
    RejectCritical,
    /// Refuse with a required-field rejection
    RejectNonCritical,
    /// Fail with a transport error
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadBehavior {
    Succeed,
    FailSubmit,
    ReportFailure(String),
    /// Never complete until the waiter is dropped
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Metadata(String),
    Create(String),
    Update(String),
    Delete(String),
    Submit(String),
    Wait(String),
}

#[derive(Default)]
struct DestinationState {
    tables: HashMap<TableRef, TableSchema>,
    rows: HashMap<TableRef, Vec<String>>,
    pending: HashMap<Uuid, (TableRef, LoadRequest)>,
    calls: Vec<Call>,
}

/// A destination that records every call and keeps tables in memory.
pub struct MockDestination {
    state: Mutex<DestinationState>,
    update: UpdateBehavior,
    loads: HashMap<String, LoadBehavior>,
}

impl Default for MockDestination {
    fn default() -> Self {
        Self::new(UpdateBehavior::Apply)
    }
}

impl MockDestination {
    pub fn new(update: UpdateBehavior) -> Self {
        Self {
            state: Mutex::new(DestinationState::default()),
            update,
            loads: HashMap::new(),
        }
    }

    pub fn with_load_behavior(mut self, table: &str, behavior: LoadBehavior) -> Self {
        self.loads.insert(table.to_string(), behavior);
        self
    }

    pub fn with_table(self, table: &str, schema: TableSchema, rows: Vec<&str>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.tables.insert(table_ref(table), schema);
            state
                .rows
                .insert(table_ref(table), rows.into_iter().map(String::from).collect());
        }
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn submitted_loads(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Submit(_)))
            .count()
    }

    pub fn table_schema(&self, table: &str) -> Option<TableSchema> {
        self.state.lock().unwrap().tables.get(&table_ref(table)).cloned()
    }

    /// Loaded rows as raw JSON lines
    pub fn rows(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .rows
            .get(&table_ref(table))
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl Destination for MockDestination {
    async fn table_metadata(
        &self,
        table: &TableRef,
    ) -> Result<Option<TableMetadata>, DestinationError> {
        self.record(Call::Metadata(table.table.clone()));
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|schema| TableMetadata {
                schema: schema.clone(),
                etag: Some("etag-1".to_string()),
            }))
    }

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), DestinationError> {
        self.record(Call::Create(table.table.clone()));
        let mut state = self.state.lock().unwrap();
        if state.tables.contains_key(table) {
            return Err(DestinationError::request("Already exists", "409"));
        }
        state.tables.insert(table.clone(), schema.clone());
        state.rows.insert(table.clone(), Vec::new());
        Ok(())
    }

    async fn update_schema(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        etag: Option<&str>,
    ) -> Result<(), DestinationError> {
        self.record(Call::Update(table.table.clone()));
        assert_eq!(etag, Some("etag-1"));
        match self.update {
            UpdateBehavior::Apply => {
                self.state
                    .lock()
                    .unwrap()
                    .tables
                    .insert(table.clone(), schema.clone());
                Ok(())
            }
            UpdateBehavior::RejectCritical => Err(DestinationError::SchemaRejected {
                table: table.clone(),
                rejection: SchemaRejection::TypeChange {
                    field: "amount".to_string(),
                    from: SemanticType::Integer,
                    to: SemanticType::Float,
                },
            }),
            UpdateBehavior::RejectNonCritical => Err(DestinationError::SchemaRejected {
                table: table.clone(),
                rejection: SchemaRejection::RequiredFieldAdded {
                    field: "code".to_string(),
                },
            }),
            UpdateBehavior::Fail => Err(DestinationError::request("Update failed", "503")),
        }
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), DestinationError> {
        self.record(Call::Delete(table.table.clone()));
        let mut state = self.state.lock().unwrap();
        state.tables.remove(table);
        state.rows.remove(table);
        Ok(())
    }

    async fn submit_load(
        &self,
        table: &TableRef,
        request: LoadRequest,
    ) -> Result<LoadJob, DestinationError> {
        self.record(Call::Submit(table.table.clone()));
        if self.loads.get(&table.table) == Some(&LoadBehavior::FailSubmit) {
            return Err(DestinationError::request("Quota exceeded", "429"));
        }
        let id = Uuid::new_v4();
        self.state
            .lock()
            .unwrap()
            .pending
            .insert(id, (table.clone(), request));
        Ok(LoadJob {
            id,
            table: table.clone(),
        })
    }

    async fn wait_for_job(&self, job: &LoadJob) -> Result<JobStatus, DestinationError> {
        self.record(Call::Wait(job.table.table.clone()));
        match self.loads.get(&job.table.table) {
            Some(LoadBehavior::ReportFailure(message)) => {
                return Ok(JobStatus::Failed {
                    message: message.clone(),
                });
            }
            Some(LoadBehavior::Hang) => futures::future::pending::<()>().await,
            _ => {}
        }

        let mut state = self.state.lock().unwrap();
        let (table, request) = state
            .pending
            .remove(&job.id)
            .ok_or_else(|| DestinationError::request("Unknown job", "404"))?;
        let lines: Vec<String> = String::from_utf8(request.payload)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        let loaded = lines.len() as u64;
        let rows = state.rows.entry(table).or_default();
        if request.write_disposition == WriteDisposition::Truncate {
            rows.clear();
        }
        rows.extend(lines);
        Ok(JobStatus::Done {
            rows_loaded: loaded,
        })
    }
}
