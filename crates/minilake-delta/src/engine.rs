//! Interruptible DuckDB connections
//!
//! The database instance is opened through the DuckDB C API and every
//! connection keeps its raw handle, so a statement that overruns its deadline
//! can be cancelled with `duckdb_interrupt` while the executing thread is
//! still inside the engine. Query results come back as Arrow record batches
//! over the Arrow C data interface.
//!
//! Interrupting and disconnecting are serialized through a mutex that guards
//! a copy of the raw handle; the copy is cleared when the connection closes,
//! so a stale [`InterruptHandle`] is a no-op.

use arrow::array::{RecordBatch, StructArray};
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::ffi::{from_ffi_and_data_type, FFI_ArrowArray, FFI_ArrowSchema};
use duckdb::ffi;
use minilake_core::recover_mutex;
use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Failure reported by the engine; the message is DuckDB's diagnostic verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError(pub String);

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// An open DuckDB database instance
#[derive(Debug)]
pub struct Database {
    raw: ffi::duckdb_database,
}

// DuckDB synchronizes access to the database instance internally
unsafe impl Send for Database {}
unsafe impl Sync for Database {}

impl Database {
    /// Open a database file, or an in-memory database when `path` is `None`
    pub fn open(path: Option<&Path>) -> EngineResult<Arc<Self>> {
        let path = match path {
            Some(path) => c_string(&path.to_string_lossy())?,
            None => c_string(":memory:")?,
        };

        let mut raw: ffi::duckdb_database = ptr::null_mut();
        let mut c_err: *mut c_char = ptr::null_mut();
        let state = unsafe { ffi::duckdb_open_ext(path.as_ptr(), &mut raw, ptr::null_mut(), &mut c_err) };
        if state != ffi::DuckDBSuccess {
            let message = unsafe { owned_message(c_err) };
            return Err(EngineError(
                message.unwrap_or_else(|| "failed to open DuckDB database".to_string()),
            ));
        }
        Ok(Arc::new(Self { raw }))
    }

    /// Open a new connection to this instance
    pub fn connect(self: &Arc<Self>) -> EngineResult<EngineConnection> {
        let mut raw: ffi::duckdb_connection = ptr::null_mut();
        let state = unsafe { ffi::duckdb_connect(self.raw, &mut raw) };
        if state != ffi::DuckDBSuccess {
            unsafe { ffi::duckdb_disconnect(&mut raw) };
            return Err(EngineError("failed to connect to DuckDB database".to_string()));
        }

        Ok(EngineConnection {
            raw,
            interrupt: Arc::new(InterruptState {
                handle: Mutex::new(raw),
                interrupted: AtomicBool::new(false),
            }),
            _database: Arc::clone(self),
        })
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        unsafe { ffi::duckdb_close(&mut self.raw) };
    }
}

#[derive(Debug)]
struct InterruptState {
    handle: Mutex<ffi::duckdb_connection>,
    interrupted: AtomicBool,
}

// The guarded pointer is only dereferenced by DuckDB while the mutex is held
unsafe impl Send for InterruptState {}
unsafe impl Sync for InterruptState {}

/// Cancels whatever statement its connection is running
#[derive(Clone)]
pub struct InterruptHandle {
    state: Arc<InterruptState>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        let handle = recover_mutex(&self.state.handle, "DuckDB interrupt");
        if !handle.is_null() {
            self.state.interrupted.store(true, Ordering::SeqCst);
            unsafe { ffi::duckdb_interrupt(*handle) };
        }
    }
}

/// One DuckDB connection; temporary views and session settings are private to it
#[derive(Debug)]
pub struct EngineConnection {
    raw: ffi::duckdb_connection,
    interrupt: Arc<InterruptState>,
    _database: Arc<Database>,
}

// A connection is used by one thread at a time; only the interrupt state is shared
unsafe impl Send for EngineConnection {}

impl EngineConnection {
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            state: Arc::clone(&self.interrupt),
        }
    }

    /// Whether a statement on this connection was ever interrupted
    pub fn was_interrupted(&self) -> bool {
        self.interrupt.interrupted.load(Ordering::SeqCst)
    }

    /// Run one or more statements, discarding their results
    pub fn execute_batch(&self, sql: &str) -> EngineResult<()> {
        let sql = c_string(sql)?;
        unsafe {
            let mut result: ffi::duckdb_result = std::mem::zeroed();
            let state = ffi::duckdb_query(self.raw, sql.as_ptr(), &mut result);
            let outcome = if state == ffi::DuckDBSuccess {
                Ok(())
            } else {
                let message = borrowed_message(ffi::duckdb_result_error(&mut result));
                Err(EngineError(
                    message.unwrap_or_else(|| "statement failed".to_string()),
                ))
            };
            ffi::duckdb_destroy_result(&mut result);
            outcome
        }
    }

    /// Run a query and collect its result as Arrow record batches
    pub fn query_arrow(&self, sql: &str) -> EngineResult<(SchemaRef, Vec<RecordBatch>)> {
        let sql = c_string(sql)?;
        let mut raw: ffi::duckdb_arrow = ptr::null_mut();
        let state = unsafe { ffi::duckdb_query_arrow(self.raw, sql.as_ptr(), &mut raw) };
        let result = ArrowResult { raw };
        if state != ffi::DuckDBSuccess {
            return Err(result.error("query failed"));
        }

        let schema = result.schema()?;
        let mut batches = Vec::new();
        while let Some(batch) = result.next_batch(&schema)? {
            batches.push(batch);
        }
        Ok((schema, batches))
    }
}

impl Drop for EngineConnection {
    fn drop(&mut self) {
        let mut handle = recover_mutex(&self.interrupt.handle, "DuckDB interrupt");
        *handle = ptr::null_mut();
        unsafe { ffi::duckdb_disconnect(&mut self.raw) };
    }
}

/// A materialized Arrow result, destroyed on drop
struct ArrowResult {
    raw: ffi::duckdb_arrow,
}

impl ArrowResult {
    fn error(&self, fallback: &str) -> EngineError {
        let message = if self.raw.is_null() {
            None
        } else {
            unsafe { borrowed_message(ffi::duckdb_query_arrow_error(self.raw)) }
        };
        EngineError(message.unwrap_or_else(|| fallback.to_string()))
    }

    fn schema(&self) -> EngineResult<SchemaRef> {
        let mut ffi_schema = FFI_ArrowSchema::empty();
        let mut out: *mut FFI_ArrowSchema = &mut ffi_schema;
        let state = unsafe {
            ffi::duckdb_query_arrow_schema(
                self.raw,
                &mut out as *mut *mut FFI_ArrowSchema as *mut ffi::duckdb_arrow_schema,
            )
        };
        if state != ffi::DuckDBSuccess {
            return Err(self.error("failed to read result schema"));
        }

        let schema = Schema::try_from(&ffi_schema)
            .map_err(|e| EngineError(format!("invalid result schema: {}", e)))?;
        Ok(Arc::new(schema))
    }

    fn next_batch(&self, schema: &SchemaRef) -> EngineResult<Option<RecordBatch>> {
        let mut array = FFI_ArrowArray::empty();
        let mut out: *mut FFI_ArrowArray = &mut array;
        let state = unsafe {
            ffi::duckdb_query_arrow_array(
                self.raw,
                &mut out as *mut *mut FFI_ArrowArray as *mut ffi::duckdb_arrow_array,
            )
        };
        if state != ffi::DuckDBSuccess {
            return Err(self.error("failed to fetch result chunk"));
        }
        // An untouched array marks the end of the result
        if array.is_released() || array.is_empty() {
            return Ok(None);
        }

        let data = unsafe { from_ffi_and_data_type(array, DataType::Struct(schema.fields().clone())) }
            .map_err(|e| EngineError(format!("invalid result chunk: {}", e)))?;
        Ok(Some(RecordBatch::from(StructArray::from(data))))
    }
}

impl Drop for ArrowResult {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { ffi::duckdb_destroy_arrow(&mut self.raw) };
        }
    }
}

fn c_string(value: &str) -> EngineResult<CString> {
    CString::new(value).map_err(|_| EngineError("SQL text contains a NUL byte".to_string()))
}

/// Copy a C string owned by the engine
unsafe fn borrowed_message(message: *const c_char) -> Option<String> {
    if message.is_null() {
        return None;
    }
    Some(CStr::from_ptr(message).to_string_lossy().into_owned())
}

/// Copy and free a C string the engine allocated for the caller
unsafe fn owned_message(message: *mut c_char) -> Option<String> {
    let copied = borrowed_message(message);
    if !message.is_null() {
        ffi::duckdb_free(message as *mut c_void);
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray, Int64Array};
    use arrow::datatypes::Int64Type;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_query_arrow_returns_batches() {
        let db = Database::open(None).unwrap();
        let conn = db.connect().unwrap();

        let (schema, batches) = conn
            .query_arrow("SELECT range AS n FROM range(5000)")
            .unwrap();

        assert_eq!(schema.field(0).name(), "n");
        let total: i64 = batches
            .iter()
            .map(|b| b.column(0).as_primitive::<Int64Type>().iter().flatten().sum::<i64>())
            .sum();
        assert_eq!(total, (0..5000).sum::<i64>());
    }

    #[test]
    fn test_empty_result_keeps_schema() {
        let db = Database::open(None).unwrap();
        let conn = db.connect().unwrap();

        let (schema, batches) = conn
            .query_arrow("SELECT 1::BIGINT AS x WHERE false")
            .unwrap();
        assert_eq!(schema.fields().len(), 1);
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 0);
    }

    #[test]
    fn test_errors_carry_engine_diagnostic() {
        let db = Database::open(None).unwrap();
        let conn = db.connect().unwrap();

        let err = conn.query_arrow("SELEC 1").unwrap_err();
        assert!(err.0.starts_with("Parser Error"));

        let err = conn.execute_batch("SELECT * FROM nowhere").unwrap_err();
        assert!(err.0.contains("nowhere"));
    }

    #[test]
    fn test_connections_share_the_database() {
        let db = Database::open(None).unwrap();
        let first = db.connect().unwrap();
        let second = db.connect().unwrap();

        first
            .execute_batch("CREATE TABLE shared AS SELECT 42::BIGINT AS answer")
            .unwrap();
        let (_, batches) = second.query_arrow("SELECT answer FROM shared").unwrap();
        let column = batches[0].column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(column.value(0), 42);
    }

    #[test]
    fn test_interrupt_stops_running_statement() {
        let db = Database::open(None).unwrap();
        let conn = db.connect().unwrap();
        let handle = conn.interrupt_handle();

        let worker = thread::spawn(move || {
            let result = conn.query_arrow("SELECT count(*) FROM range(100000000) a, range(100000000) b");
            (result, conn.was_interrupted())
        });

        let started = Instant::now();
        while !worker.is_finished() {
            assert!(started.elapsed() < Duration::from_secs(30), "statement ignored the interrupt");
            thread::sleep(Duration::from_millis(50));
            handle.interrupt();
        }

        let (result, interrupted) = worker.join().unwrap();
        assert!(result.is_err());
        assert!(interrupted);
    }

    #[test]
    fn test_interrupt_after_close_is_noop() {
        let db = Database::open(None).unwrap();
        let conn = db.connect().unwrap();
        let handle = conn.interrupt_handle();
        drop(conn);
        handle.interrupt();
    }
}
