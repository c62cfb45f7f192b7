//! # minilake on Delta Lake
//!
//! Storage sessions, ingestion and SQL query execution over Delta tables kept
//! in S3-compatible object storage (or a local directory).
//!
//! - [`ConnectionManager`] opens one process-wide session: an embedded DuckDB
//!   instance with the storage endpoint registered, plus the object store
//!   options delta-rs needs.
//! - [`IngestionService`] loads CSV, Parquet or JSON sources and commits them
//!   atomically as a new table version.
//! - [`QueryExecutor`] runs SQL against the latest committed snapshot of every
//!   table the query names.
//! - [`TableMaintenance`] exposes history, vacuum and compaction.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use minilake_core::{IngestRequest, WriteMode};
//! use minilake_delta::{ConnectionManager, IngestionService, QueryExecutor};
//! use minilake_registry::TableRegistry;
//!
//! let handle = ConnectionManager::default().get_connection(None).await?;
//! let registry = TableRegistry::in_memory().await?;
//!
//! let sales = handle.default_table_ref("sales")?;
//! IngestionService::new(handle.clone(), registry.clone())
//!     .ingest(IngestRequest::from_path("sales.csv", sales, WriteMode::Create))
//!     .await?;
//!
//! let result = QueryExecutor::new(handle, registry)
//!     .execute_query("SELECT SUM(amount) AS total FROM sales")
//!     .await?;
//! println!("{:?}", result.scalar());
//! ```

pub use connection::{ConnectionHandle, ConnectionManager};
pub use engine::{Database, EngineConnection, InterruptHandle};
pub use ingestion::{IngestionService, PreparedIngest};
pub use maintenance::{OptimizeReport, TableMaintenance, VacuumReport, MIN_RETENTION_HOURS};
pub use pool::{DuckDBPool, PooledDuckDBConnection};
pub use query::{QueryExecutor, QueryOptions};

pub mod connection;
pub mod convert;
pub mod engine;
pub mod ingestion;
pub mod maintenance;
pub mod observability;
pub mod pool;
pub mod query;
pub mod snapshot;
pub mod sql;
