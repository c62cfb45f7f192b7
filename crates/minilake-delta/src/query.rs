//! SQL execution over registered Delta tables
//!
//! Each call re-resolves the tables a query references: the registry maps the
//! name to a location, the Delta log is loaded afresh, and the snapshot's data
//! files are bound as a temporary DuckDB view on the connection that runs the
//! query. Views are dropped when the query finishes, so nothing about a
//! table's state outlives the call.
//!
//! A query that overruns its timeout is interrupted inside the engine, and
//! the executor waits for the statement to stop before reporting
//! [`Error::QueryTimeout`]; the interrupted connection is then discarded by
//! the pool rather than reused.

use crate::connection::ConnectionHandle;
use crate::convert::to_query_result;
use crate::engine::{EngineConnection, EngineError, InterruptHandle};
use crate::observability::{
    increment_query_errors, increment_query_rows, increment_query_timeouts, time_query,
};
use crate::pool::PooledDuckDBConnection;
use crate::snapshot::{
    commit_history, data_files, open_as_of, open_latest, open_version, table_schema,
};
use crate::sql::{duckdb_type, quote_ident, quote_literal, referenced_tables};
use arrow::datatypes::Schema;
use chrono::{DateTime, Utc};
use minilake_core::{
    retry_async, Error, QueryResult, QuerySettings, Result, RetryPolicy, TableInfo, TableRef,
    TableSchema,
};
use minilake_registry::TableRegistry;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const DESCRIBE_HISTORY_LIMIT: usize = 10;

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Abandon the query after this long (falls back to the executor default)
    pub timeout: Option<Duration>,
    /// Read these tables at a fixed committed version instead of the latest
    pub versions: HashMap<String, i64>,
    /// Read these tables as they were at a point in time; a pinned version wins
    pub timestamps: HashMap<String, DateTime<Utc>>,
}

impl QueryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn at_version(mut self, table: &str, version: i64) -> Self {
        self.versions.insert(table.to_lowercase(), version);
        self
    }

    pub fn as_of(mut self, table: &str, at: DateTime<Utc>) -> Self {
        self.timestamps.insert(table.to_lowercase(), at);
        self
    }

    fn snapshot_of(&self, table: &str) -> SnapshotPin {
        if let Some(version) = self.versions.get(table) {
            SnapshotPin::Version(*version)
        } else if let Some(at) = self.timestamps.get(table) {
            SnapshotPin::AsOf(*at)
        } else {
            SnapshotPin::Latest
        }
    }
}

/// Which committed snapshot of a table a query reads
#[derive(Debug, Clone, Copy, PartialEq)]
enum SnapshotPin {
    Latest,
    Version(i64),
    AsOf(DateTime<Utc>),
}

/// A table bound for one query
#[derive(Debug, Clone)]
struct TableBinding {
    name: String,
    view_sql: String,
}

/// Runs SQL against registered tables
#[derive(Clone)]
pub struct QueryExecutor {
    handle: ConnectionHandle,
    registry: TableRegistry,
    retry: RetryPolicy,
    settings: QuerySettings,
}

impl QueryExecutor {
    pub fn new(handle: ConnectionHandle, registry: TableRegistry) -> Self {
        Self {
            handle,
            registry,
            retry: RetryPolicy::default(),
            settings: QuerySettings::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_settings(mut self, settings: QuerySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Execute `sql` against the latest snapshot of every table it references
    pub async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        self.execute_query_with(sql, QueryOptions::default()).await
    }

    pub async fn execute_query_with(&self, sql: &str, options: QueryOptions) -> Result<QueryResult> {
        let _timer = time_query();
        let deadline = options
            .timeout
            .or_else(|| self.settings.default_timeout())
            .map(|limit| (Instant::now() + limit, limit));

        let result = self.run(sql, &options, deadline).await;

        match &result {
            Ok(rows) => increment_query_rows(rows.row_count()),
            Err(err) => {
                if matches!(err, Error::QueryTimeout { .. }) {
                    warn!("Query timed out: {}", err);
                    increment_query_timeouts();
                }
                increment_query_errors();
            }
        }
        result
    }

    async fn run(
        &self,
        sql: &str,
        options: &QueryOptions,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<QueryResult> {
        let bindings = within(deadline, self.bind_tables(sql, options)).await?;
        debug!(
            "Executing query with {} bound table(s): {}",
            bindings.len(),
            bindings
                .iter()
                .map(|b| b.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let handle = self.handle.clone();
        let conn = within(deadline, async move {
            tokio::task::spawn_blocking(move || handle.connection()).await?
        })
        .await?;

        let cancel = CancelOnDrop::new(conn.interrupt_handle());
        let sql = sql.to_string();
        let mut task = tokio::task::spawn_blocking(move || run_blocking(conn, &sql, &bindings));

        let Some((at, limit)) = deadline else {
            let result = task.await?;
            cancel.disarm();
            return result;
        };

        match tokio::time::timeout_at(at, &mut task).await {
            Ok(joined) => {
                cancel.disarm();
                joined?
            }
            Err(_) => {
                cancel.interrupt();
                // The pooled connection is only released once the statement has stopped
                if let Err(err) = task.await? {
                    debug!("Interrupted query stopped with: {}", err);
                }
                Err(timed_out(limit))
            }
        }
    }

    /// Resolve and snapshot every registered table the query references
    async fn bind_tables(&self, sql: &str, options: &QueryOptions) -> Result<Vec<TableBinding>> {
        let mut bindings = Vec::new();

        match referenced_tables(sql) {
            Some(names) => {
                for name in names {
                    let table = match self.registry.resolve(&name).await {
                        Ok(table) => table,
                        // CTEs, table functions and unknown names are left to the engine
                        Err(Error::TableNotFound(_)) => continue,
                        Err(err) => return Err(err),
                    };
                    let pin = options.snapshot_of(&table.name);
                    if let Some(binding) = self.binding_for(&table, pin, true).await? {
                        bindings.push(binding);
                    }
                }
            }
            None => {
                // Unparseable here; bind everything so the engine reports the real problem
                for entry in self.registry.list().await? {
                    let pin = options.snapshot_of(&entry.table.name);
                    if let Some(binding) = self.binding_for(&entry.table, pin, false).await? {
                        bindings.push(binding);
                    }
                }
            }
        }

        Ok(bindings)
    }

    async fn binding_for(
        &self,
        table: &TableRef,
        pin: SnapshotPin,
        required: bool,
    ) -> Result<Option<TableBinding>> {
        let uri = self.handle.table_uri(table);
        let options = self.handle.storage_options().clone();

        let snapshot = retry_async(&self.retry, "load table snapshot", || {
            let uri = uri.clone();
            let options = options.clone();
            async move {
                match pin {
                    SnapshotPin::Latest => open_latest(&uri, &options).await,
                    SnapshotPin::Version(v) => open_version(&uri, &options, v).await,
                    SnapshotPin::AsOf(at) => open_as_of(&uri, &options, at).await,
                }
            }
        })
        .await?;

        let Some(snapshot) = snapshot else {
            if required {
                return Err(Error::TableNotFound(format!(
                    "Table '{}' is registered but has no committed data at {}",
                    table.name, uri
                )));
            }
            return Ok(None);
        };

        let schema = table_schema(&snapshot)?;
        let files = data_files(&snapshot)?;
        debug!(
            "Bound table '{}' at version {} ({} file(s))",
            table.name,
            snapshot.version(),
            files.len()
        );

        Ok(Some(TableBinding {
            name: table.name.clone(),
            view_sql: view_sql(&table.name, &schema, &files),
        }))
    }

    /// Location, latest version, schema, file count and recent history of a table
    pub async fn describe_table(&self, name: &str) -> Result<TableInfo> {
        let table = self.registry.resolve(name).await?;
        let uri = self.handle.table_uri(&table);
        let options = self.handle.storage_options().clone();

        let snapshot = retry_async(&self.retry, "load table snapshot", || {
            let uri = uri.clone();
            let options = options.clone();
            async move { open_latest(&uri, &options).await }
        })
        .await?
        .ok_or_else(|| {
            Error::TableNotFound(format!(
                "Table '{}' is registered but has no committed data at {}",
                table.name, uri
            ))
        })?;

        let schema = table_schema(&snapshot)?;
        Ok(TableInfo {
            version: snapshot.version(),
            schema: TableSchema::from_arrow(&schema),
            file_count: data_files(&snapshot)?.len(),
            history: commit_history(&snapshot, DESCRIBE_HISTORY_LIMIT).await?,
            uri,
            table,
        })
    }

    /// First `limit` rows of a table
    pub async fn sample_table(&self, name: &str, limit: usize) -> Result<QueryResult> {
        let table = self.registry.resolve(name).await?;
        self.execute_query(&format!(
            "SELECT * FROM {} LIMIT {}",
            quote_ident(&table.name),
            limit
        ))
        .await
    }
}

fn view_sql(name: &str, schema: &Schema, files: &[String]) -> String {
    let view = quote_ident(name);

    if files.is_empty() {
        let columns = schema
            .fields()
            .iter()
            .map(|f| {
                format!(
                    "CAST(NULL AS {}) AS {}",
                    duckdb_type(f.data_type()),
                    quote_ident(f.name())
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        return format!(
            "CREATE OR REPLACE TEMP VIEW {} AS SELECT {} WHERE false",
            view, columns
        );
    }

    let columns = schema
        .fields()
        .iter()
        .map(|f| quote_ident(f.name()))
        .collect::<Vec<_>>()
        .join(", ");
    let files = files
        .iter()
        .map(|f| quote_literal(f))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE OR REPLACE TEMP VIEW {} AS SELECT {} FROM read_parquet([{}], union_by_name = true)",
        view, columns, files
    )
}

/// Drops the temporary views of one query when it goes out of scope
struct ViewGuard<'a> {
    conn: &'a EngineConnection,
    names: Vec<String>,
}

impl<'a> ViewGuard<'a> {
    fn create(conn: &'a EngineConnection, bindings: &[TableBinding]) -> Result<Self> {
        let mut guard = Self {
            conn,
            names: Vec::with_capacity(bindings.len()),
        };
        for binding in bindings {
            conn.execute_batch(&binding.view_sql).map_err(engine_error)?;
            guard.names.push(binding.name.clone());
        }
        Ok(guard)
    }
}

impl Drop for ViewGuard<'_> {
    fn drop(&mut self) {
        // An interrupted connection is discarded along with its views
        if self.conn.was_interrupted() {
            return;
        }
        for name in &self.names {
            let sql = format!("DROP VIEW IF EXISTS {}", quote_ident(name));
            if let Err(e) = self.conn.execute_batch(&sql) {
                warn!("Failed to drop temporary view '{}': {}", name, e);
            }
        }
    }
}

/// Interrupts the running statement unless disarmed first
///
/// Covers callers that drop an in-flight query future as well as timeouts.
struct CancelOnDrop {
    handle: Option<InterruptHandle>,
}

impl CancelOnDrop {
    fn new(handle: InterruptHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn disarm(mut self) {
        self.handle = None;
    }

    fn interrupt(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.interrupt();
        }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.interrupt();
        }
    }
}

/// Await `work`, giving up with [`Error::QueryTimeout`] at the deadline
async fn within<T>(
    deadline: Option<(Instant, Duration)>,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some((at, limit)) => tokio::time::timeout_at(at, work)
            .await
            .map_err(|_| timed_out(limit))?,
        None => work.await,
    }
}

fn timed_out(limit: Duration) -> Error {
    Error::QueryTimeout {
        timeout_ms: limit.as_millis() as u64,
    }
}

fn run_blocking(
    conn: PooledDuckDBConnection,
    sql: &str,
    bindings: &[TableBinding],
) -> Result<QueryResult> {
    let _views = ViewGuard::create(&conn, bindings)?;
    let (schema, batches) = conn.query_arrow(sql).map_err(engine_error)?;
    to_query_result(&schema, &batches)
}

/// Classify an engine error, keeping its diagnostic verbatim
fn engine_error(err: EngineError) -> Error {
    let EngineError(message) = err;
    if message.contains("Parser Error") {
        Error::QueryParse(message)
    } else if message.contains("Catalog Error") && message.contains("Table with name") {
        Error::TableNotFound(message)
    } else {
        Error::QueryExecution(message)
    }
}
