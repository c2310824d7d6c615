//! PostgreSQL warehouse destination.
//!
//! The project identifier selects the database (the configured URL is
//! re-targeted at it) and the dataset identifier selects the schema. Load
//! jobs run as background tasks inside a single transaction, so a failed or
//! aborted load leaves the previous table contents in place.

use std::collections::HashMap;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgExecutor, Postgres, QueryBuilder};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use super::{
    Destination, DestinationError, JobStatus, LoadJob, LoadRequest, SchemaRejection,
    SourceFormat, TableMetadata, TableRef, WriteDisposition,
};
use crate::error::{SyncError, redact_database_url};
use crate::models::{SchemaField, SemanticType, TableSchema};
use crate::schema::{compare_schemas, map_native_type};
use crate::source::quote_identifier;

/// Bind parameter ceiling per INSERT statement.
const MAX_BIND_PARAMS: usize = 60_000;

const COLUMNS_QUERY: &str = r"
    SELECT column_name::text, data_type::text, is_nullable::text
    FROM information_schema.columns
    WHERE table_catalog = current_database()
      AND table_schema = $1
      AND table_name = $2
    ORDER BY ordinal_position
";

type JobHandle = JoinHandle<Result<u64, String>>;

/// A PostgreSQL database acting as the sync destination.
pub struct PostgresWarehouse {
    pool: PgPool,
    project: String,
    jobs: Mutex<HashMap<Uuid, AbortOnDrop>>,
}

impl PostgresWarehouse {
    /// Connects to the project database on the server named by `url`.
    ///
    /// # Errors
    /// Returns a configuration error for malformed URLs and a connection
    /// error when the server cannot be reached.
    pub async fn connect(url: &str, project: &str, max_connections: u32) -> crate::Result<Self> {
        let target = connection_url_for_database(url, project)?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&target)
            .await
            .map_err(|e| {
                SyncError::connection_failed(
                    format!(
                        "Failed to connect to warehouse at {}",
                        redact_database_url(&target)
                    ),
                    e,
                )
            })?;

        tracing::info!(warehouse = %redact_database_url(&target), "Connected to warehouse");
        Ok(Self::from_pool(pool, project))
    }

    /// Wraps an existing pool already connected to the project database.
    pub fn from_pool(pool: PgPool, project: impl Into<String>) -> Self {
        Self {
            pool,
            project: project.into(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Aborts load jobs nobody waited for, then closes the pool.
    pub async fn close(&self) {
        let abandoned = std::mem::take(&mut *self.jobs.lock().await);
        if !abandoned.is_empty() {
            tracing::warn!(jobs = abandoned.len(), "Aborting load jobs that were never awaited");
        }
        drop(abandoned);
        self.pool.close().await;
    }

    /// Registers a background load under a fresh job id.
    ///
    /// The task is spawned while the job table is locked, so it is always
    /// owned by the table (and aborted with it) once it exists.
    async fn spawn_job<F>(&self, load: F) -> Uuid
    where
        F: Future<Output = Result<u64, String>> + Send + 'static,
    {
        let mut jobs = self.jobs.lock().await;
        let id = Uuid::new_v4();
        jobs.insert(id, AbortOnDrop(tokio::spawn(load)));
        id
    }

    fn check_project(&self, table: &TableRef) -> Result<(), DestinationError> {
        if table.project == self.project {
            Ok(())
        } else {
            Err(DestinationError::request(
                format!(
                    "Table {table} is outside project '{}' served by this warehouse",
                    self.project
                ),
                "project mismatch",
            ))
        }
    }
}

/// Generates a connection URL for a different database on the same server.
///
/// # Errors
/// Returns a configuration error if the URL cannot be parsed, does not use a
/// PostgreSQL scheme, or the database name is unsafe.
pub fn connection_url_for_database(url: &str, database: &str) -> crate::Result<String> {
    if database.is_empty() || database.len() > 63 {
        return Err(SyncError::configuration(format!(
            "Invalid database name length: must be 1-63 characters, got {}",
            database.len()
        )));
    }

    if database.contains(';') || database.contains('\'') || database.contains('"') {
        return Err(SyncError::configuration(
            "Database name contains invalid characters",
        ));
    }

    let mut parsed = Url::parse(url).map_err(|e| {
        SyncError::configuration(format!("Failed to parse warehouse URL: {e}"))
    })?;

    if !matches!(parsed.scheme(), "postgres" | "postgresql") {
        return Err(SyncError::configuration(
            "Warehouse URL must use postgres:// or postgresql:// scheme",
        ));
    }

    parsed.set_path(&format!("/{database}"));
    Ok(parsed.to_string())
}

/// Column type used to store a semantic type.
pub const fn pg_type(field_type: SemanticType) -> &'static str {
    match field_type {
        SemanticType::String => "TEXT",
        SemanticType::Integer => "BIGINT",
        SemanticType::Float => "DOUBLE PRECISION",
        SemanticType::Date => "DATE",
        SemanticType::Timestamp => "TIMESTAMPTZ",
        SemanticType::Boolean => "BOOLEAN",
    }
}

/// Maps an `information_schema.columns.data_type` value back to a semantic type.
pub fn semantic_from_pg(data_type: &str) -> SemanticType {
    match data_type {
        "timestamp with time zone" | "timestamp without time zone" => SemanticType::Timestamp,
        other => map_native_type(other),
    }
}

fn qualified_name(table: &TableRef) -> String {
    format!(
        "{}.{}",
        quote_identifier(&table.dataset, '"'),
        quote_identifier(&table.table, '"')
    )
}

fn column_definition(field: &SchemaField) -> String {
    let mut definition = format!(
        "{} {}",
        quote_identifier(&field.name, '"'),
        pg_type(field.field_type)
    );
    if field.required {
        definition.push_str(" NOT NULL");
    }
    definition
}

fn schema_etag(schema: &TableSchema) -> String {
    let mut hasher = DefaultHasher::new();
    for field in schema.fields() {
        field.name.hash(&mut hasher);
        field.field_type.hash(&mut hasher);
        field.required.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

async fn read_schema<'e, E>(
    executor: E,
    table: &TableRef,
) -> Result<Option<TableSchema>, DestinationError>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String, String, String)> = sqlx::query_as(COLUMNS_QUERY)
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_all(executor)
        .await
        .map_err(|e| DestinationError::request(format!("Failed to read metadata of {table}"), e))?;

    if rows.is_empty() {
        return Ok(None);
    }

    let fields = rows
        .into_iter()
        .map(|(name, data_type, is_nullable)| SchemaField {
            name,
            field_type: semantic_from_pg(&data_type),
            required: is_nullable == "NO",
        })
        .collect();

    TableSchema::new(fields)
        .map(Some)
        .map_err(|e| DestinationError::request(format!("Invalid schema for {table}"), e))
}

/// Decides the in-place migration from `current` to `incoming`.
///
/// Returns the statements to run, or the rejection that prevents the update.
fn plan_update(
    table: &TableRef,
    current: &TableSchema,
    incoming: &TableSchema,
) -> Result<Vec<String>, SchemaRejection> {
    let comparison = compare_schemas(current, incoming);

    if let Some((field, from, to)) = comparison.type_changes.first() {
        return Err(SchemaRejection::TypeChange {
            field: field.clone(),
            from: *from,
            to: *to,
        });
    }
    if let Some(field) = comparison.missing_fields.first() {
        return Err(SchemaRejection::FieldRemoved {
            field: field.name.clone(),
        });
    }
    if let Some(field) = comparison.first_new_required_field() {
        return Err(SchemaRejection::RequiredFieldAdded {
            field: field.name.clone(),
        });
    }

    let target = qualified_name(table);
    let mut statements: Vec<String> = comparison
        .new_fields
        .iter()
        .map(|field| format!("ALTER TABLE {target} ADD COLUMN {}", column_definition(field)))
        .collect();

    for field in incoming.fields().iter().filter(|f| !f.required) {
        if current.field(&field.name).is_some_and(|existing| existing.required) {
            statements.push(format!(
                "ALTER TABLE {target} ALTER COLUMN {} DROP NOT NULL",
                quote_identifier(&field.name, '"')
            ));
        }
    }

    Ok(statements)
}

fn json_param(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn parse_payload(payload: &[u8], schema: &TableSchema) -> Result<Vec<Map<String, Value>>, String> {
    let text = std::str::from_utf8(payload).map_err(|e| format!("payload is not UTF-8: {e}"))?;
    let mut records = Vec::new();

    for (line_number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Map<String, Value> = serde_json::from_str(line)
            .map_err(|e| format!("line {}: invalid JSON object: {e}", line_number + 1))?;
        if let Some(unknown) = record.keys().find(|key| schema.field(key).is_none()) {
            return Err(format!("line {}: no such field '{unknown}'", line_number + 1));
        }
        records.push(record);
    }

    Ok(records)
}

async fn run_load(
    pool: PgPool,
    table: TableRef,
    schema: TableSchema,
    request: LoadRequest,
) -> Result<u64, String> {
    let records = parse_payload(&request.payload, &schema)?;
    let target = qualified_name(&table);
    let fields = schema.fields();

    let mut tx = pool.begin().await.map_err(|e| e.to_string())?;

    if request.write_disposition == WriteDisposition::Truncate {
        sqlx::query(&format!("TRUNCATE TABLE {target}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| format!("truncate failed: {e}"))?;
    }

    let column_list = fields
        .iter()
        .map(|f| quote_identifier(&f.name, '"'))
        .collect::<Vec<_>>()
        .join(", ");
    let chunk_size = (MAX_BIND_PARAMS / fields.len().max(1)).max(1);
    let mut loaded = 0_u64;

    for chunk in records.chunks(chunk_size) {
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("INSERT INTO {target} ({column_list}) "));
        builder.push_values(chunk, |mut row, record| {
            for field in fields {
                row.push_bind(json_param(record.get(&field.name)))
                    .push_unseparated(format!("::{}", pg_type(field.field_type)));
            }
        });

        let result = builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| format!("insert failed: {e}"))?;
        loaded += result.rows_affected();
    }

    tx.commit().await.map_err(|e| format!("commit failed: {e}"))?;
    Ok(loaded)
}

/// Aborts the wrapped job when dropped before it finishes.
struct AbortOnDrop(JobHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl Destination for PostgresWarehouse {
    async fn table_metadata(
        &self,
        table: &TableRef,
    ) -> Result<Option<TableMetadata>, DestinationError> {
        self.check_project(table)?;
        let schema = read_schema(&self.pool, table).await?;
        Ok(schema.map(|schema| TableMetadata {
            etag: Some(schema_etag(&schema)),
            schema,
        }))
    }

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), DestinationError> {
        self.check_project(table)?;
        let columns = schema
            .fields()
            .iter()
            .map(column_definition)
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DestinationError::request("Failed to begin transaction", e))?;

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_identifier(&table.dataset, '"')
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| DestinationError::request(format!("Failed to create dataset for {table}"), e))?;

        sqlx::query(&format!("CREATE TABLE {} ({columns})", qualified_name(table)))
            .execute(&mut *tx)
            .await
            .map_err(|e| DestinationError::request(format!("Failed to create table {table}"), e))?;

        tx.commit()
            .await
            .map_err(|e| DestinationError::request(format!("Failed to create table {table}"), e))
    }

    async fn update_schema(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        etag: Option<&str>,
    ) -> Result<(), DestinationError> {
        self.check_project(table)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DestinationError::request("Failed to begin transaction", e))?;

        let current = read_schema(&mut *tx, table)
            .await?
            .ok_or_else(|| DestinationError::NotFound {
                table: table.clone(),
            })?;

        if let Some(expected) = etag
            && schema_etag(&current) != expected
        {
            return Err(DestinationError::request(
                format!("Table {table} changed since its metadata was read"),
                "etag mismatch",
            ));
        }

        let statements = plan_update(table, &current, schema).map_err(|rejection| {
            DestinationError::SchemaRejected {
                table: table.clone(),
                rejection,
            }
        })?;

        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| DestinationError::request(format!("Failed to update {table}"), e))?;
        }

        tx.commit()
            .await
            .map_err(|e| DestinationError::request(format!("Failed to update {table}"), e))
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), DestinationError> {
        self.check_project(table)?;
        sqlx::query(&format!("DROP TABLE {}", qualified_name(table)))
            .execute(&self.pool)
            .await
            .map_err(|e| DestinationError::request(format!("Failed to delete table {table}"), e))?;
        Ok(())
    }

    async fn submit_load(
        &self,
        table: &TableRef,
        request: LoadRequest,
    ) -> Result<LoadJob, DestinationError> {
        self.check_project(table)?;
        if request.format != SourceFormat::NewlineDelimitedJson {
            return Err(DestinationError::request(
                "Unsupported load format",
                format!("{:?}", request.format),
            ));
        }

        let schema = read_schema(&self.pool, table)
            .await?
            .ok_or_else(|| DestinationError::NotFound {
                table: table.clone(),
            })?;

        let id = self
            .spawn_job(run_load(self.pool.clone(), table.clone(), schema, request))
            .await;

        Ok(LoadJob {
            id,
            table: table.clone(),
        })
    }

    async fn wait_for_job(&self, job: &LoadJob) -> Result<JobStatus, DestinationError> {
        let mut guard = self
            .jobs
            .lock()
            .await
            .remove(&job.id)
            .ok_or_else(|| {
                DestinationError::request(format!("Unknown load job {}", job.id), "not found")
            })?;

        match (&mut guard.0).await {
            Ok(Ok(rows_loaded)) => Ok(JobStatus::Done { rows_loaded }),
            Ok(Err(message)) => Ok(JobStatus::Failed { message }),
            Err(e) => Err(DestinationError::request(
                format!("Load job {} terminated abnormally", job.id),
                e,
            )),
        }
    }
}
