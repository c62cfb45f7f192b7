//! DuckDB connection pool
//!
//! Pooled connections all attach to one database instance, so settings,
//! loaded extensions and storage secrets applied through the setup connection
//! are visible to every pooled connection, while temporary views stay private
//! to the connection that created them.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  DuckDB database instance                    │
//! │  threads / memory_limit / S3 secret          │
//! └──────────────────────────────────────────────┘
//!       ↑ connect        ↑ connect        ↑ connect
//!   ┌────────┐       ┌────────┐       ┌────────┐
//!   │ Conn 1 │       │ Conn 2 │       │ Conn 3 │
//!   └────────┘       └────────┘       └────────┘
//!    query A          query B          storage check
//! ```
//!
//! A connection whose statement was interrupted is discarded when it returns
//! to the pool instead of being handed out again.

use crate::engine::{Database, EngineConnection};
use minilake_core::{EngineConfig, Error, Result};
use r2d2::{ManageConnection, Pool, PooledConnection};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Open the database instance and apply instance-wide settings
///
/// Returns the instance together with the connection that configured it, for
/// any further session setup.
pub fn open_database(config: &EngineConfig) -> Result<(Arc<Database>, EngineConnection)> {
    if let Some(db_path) = &config.db_path {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::config(format!(
                    "failed to create DuckDB directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        debug!("Opening persistent DuckDB database at: {:?}", db_path);
    } else {
        debug!("Opening in-memory DuckDB database");
    }

    let database = Database::open(config.db_path.as_deref())
        .map_err(|e| Error::internal(format!("failed to open DuckDB: {}", e)))?;
    let setup = database
        .connect()
        .map_err(|e| Error::internal(format!("failed to connect to DuckDB: {}", e)))?;

    configure_instance(&setup, config)?;
    Ok((database, setup))
}

fn configure_instance(conn: &EngineConnection, config: &EngineConfig) -> Result<()> {
    let mut settings = Vec::new();
    if config.threads > 0 {
        settings.push(format!("SET threads = {};", config.threads));
    }
    settings.push(format!(
        "SET memory_limit = {};",
        crate::sql::quote_literal(&config.memory_limit)
    ));
    if let Some(temp_dir) = &config.temp_directory {
        std::fs::create_dir_all(temp_dir).map_err(|e| {
            Error::config(format!(
                "failed to create DuckDB temp directory {}: {}",
                temp_dir.display(),
                e
            ))
        })?;
        settings.push(format!(
            "SET temp_directory = {};",
            crate::sql::quote_literal(&temp_dir.to_string_lossy())
        ));
    }

    conn.execute_batch(&settings.join("\n"))
        .map_err(|e| Error::config(format!("invalid engine settings: {}", e)))?;

    debug!(
        "Configured DuckDB instance: threads={}, memory_limit={}",
        config.threads, config.memory_limit
    );
    Ok(())
}

/// r2d2 manager handing out connections to one database instance
pub struct DuckDBConnectionManager {
    database: Arc<Database>,
}

impl DuckDBConnectionManager {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = EngineConnection;
    type Error = Error;

    fn connect(&self) -> Result<EngineConnection> {
        self.database
            .connect()
            .map_err(|e| Error::internal(format!("failed to open DuckDB connection: {}", e)))
    }

    fn is_valid(&self, conn: &mut EngineConnection) -> Result<()> {
        conn.execute_batch("SELECT 1")
            .map_err(|e| Error::internal(format!("DuckDB connection unhealthy: {}", e)))
    }

    fn has_broken(&self, conn: &mut EngineConnection) -> bool {
        conn.was_interrupted()
    }
}

pub type DuckDBPool = Pool<DuckDBConnectionManager>;

pub type PooledDuckDBConnection = PooledConnection<DuckDBConnectionManager>;

/// Build a pool over an already configured database instance
pub fn create_duckdb_pool(database: Arc<Database>, config: &EngineConfig) -> Result<DuckDBPool> {
    let pool = Pool::builder()
        .max_size(config.pool_size.max(1))
        .min_idle(Some(0))
        .connection_timeout(Duration::from_secs(config.connection_timeout_secs.max(1)))
        .build(DuckDBConnectionManager::new(database))
        .map_err(|e| Error::internal(format!("failed to create DuckDB pool: {}", e)))?;

    info!(
        "Created DuckDB connection pool: {} connections, {} memory limit",
        config.pool_size, config.memory_limit
    );
    Ok(pool)
}

/// Check out a pooled connection; exhaustion is reported as a connection error
pub fn checkout(pool: &DuckDBPool) -> Result<PooledDuckDBConnection> {
    pool.get()
        .map_err(|e| Error::connection(format!("no DuckDB connection available: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array};

    fn engine(pool_size: u32) -> EngineConfig {
        EngineConfig {
            pool_size,
            threads: 1,
            memory_limit: "512MB".to_string(),
            connection_timeout_secs: 5,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_pool_creation() {
        let config = engine(2);
        let (database, _) = open_database(&config).unwrap();
        let pool = create_duckdb_pool(database, &config).unwrap();
        assert_eq!(pool.max_size(), 2);
    }

    #[test]
    fn test_pooled_connections_share_the_database() {
        let config = engine(2);
        let (database, setup) = open_database(&config).unwrap();
        let pool = create_duckdb_pool(database, &config).unwrap();

        setup
            .execute_batch("CREATE TABLE shared AS SELECT 42::BIGINT AS answer")
            .unwrap();

        let conn = checkout(&pool).unwrap();
        let (_, batches) = conn.query_arrow("SELECT answer FROM shared").unwrap();
        let answer = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(answer.value(0), 42);
    }

    #[test]
    fn test_temp_views_are_connection_local() {
        let config = engine(2);
        let (database, _) = open_database(&config).unwrap();
        let pool = create_duckdb_pool(database, &config).unwrap();

        let first = checkout(&pool).unwrap();
        let second = checkout(&pool).unwrap();
        first
            .execute_batch("CREATE TEMP VIEW private_view AS SELECT 1 AS x")
            .unwrap();

        assert!(second.execute_batch("SELECT * FROM private_view").is_err());
    }

    #[test]
    fn test_interrupted_connection_is_replaced() {
        let config = engine(1);
        let (database, _) = open_database(&config).unwrap();
        let pool = create_duckdb_pool(database, &config).unwrap();

        {
            let conn = checkout(&pool).unwrap();
            conn.execute_batch("CREATE TEMP VIEW marker AS SELECT 1 AS x")
                .unwrap();
            conn.interrupt_handle().interrupt();
        }

        let conn = checkout(&pool).unwrap();
        assert!(!conn.was_interrupted());
        assert!(conn.execute_batch("SELECT * FROM marker").is_err());
    }

    #[test]
    fn test_invalid_memory_limit_is_configuration_error() {
        let config = EngineConfig {
            memory_limit: "lots".to_string(),
            ..engine(1)
        };
        let err = open_database(&config).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
