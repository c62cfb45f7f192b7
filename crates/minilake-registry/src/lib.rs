//! Table registry for minilake
//!
//! Maps logical table names to physical Delta table locations
//! (`bucket/prefix/name`). The query engine uses it to turn identifiers in SQL
//! into storage locations, and ingestion registers every table it creates.
//!
//! Registration is idempotent: registering the same name with the same
//! location is a no-op, a different location is a [`Error::Conflict`].
//!
//! # Examples
//!
//! ```rust,ignore
//! use minilake_core::TableFormat;
//! use minilake_registry::{RegistryConfig, TableRegistry};
//!
//! #[tokio::main]
//! async fn main() -> minilake_core::Result<()> {
//!     let registry = TableRegistry::new(RegistryConfig::sqlite("./registry.db")).await?;
//!
//!     registry.register("sales", "lake", "raw", TableFormat::Delta).await?;
//!     let table = registry.resolve("SALES").await?;
//!     assert_eq!(table.location(), "lake/raw/sales");
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use minilake_core::types::normalize_table_name;
use minilake_core::{Error, Result, TableFormat, TableRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub mod backend;
pub use backend::{RegistryBackend, RegistryConfig};

mod schema;
mod sqlite_backend;

pub use sqlite_backend::SqliteBackend;

/// One registered table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub table: TableRef,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub registered_at: DateTime<Utc>,
}

/// Table registry with pluggable backend
#[derive(Clone)]
pub struct TableRegistry {
    backend: Arc<dyn RegistryBackend>,
}

impl TableRegistry {
    /// Open the registry described by `config` and make sure its schema exists
    pub async fn new(config: RegistryConfig) -> Result<Self> {
        let backend: Arc<dyn RegistryBackend> = match config {
            RegistryConfig::SQLite { path } => Arc::new(SqliteBackend::new(&path)?),
        };
        Self::with_backend(backend).await
    }

    /// Create in-memory registry (for testing)
    pub async fn in_memory() -> Result<Self> {
        Self::with_backend(Arc::new(SqliteBackend::in_memory()?)).await
    }

    pub async fn with_backend(backend: Arc<dyn RegistryBackend>) -> Result<Self> {
        backend.init_schema().await?;
        Ok(Self { backend })
    }

    /// Map a logical name to its table reference
    ///
    /// Lookup is case-insensitive. Fails with [`Error::TableNotFound`] when
    /// the name was never registered.
    pub async fn resolve(&self, name: &str) -> Result<TableRef> {
        let normalized = normalize_table_name(name)
            .map_err(|_| Error::TableNotFound(format!("Table '{}' not found", name)))?;

        match self.backend.get_table(&normalized).await? {
            Some(entry) => Ok(entry.table),
            None => Err(Error::TableNotFound(format!(
                "Table '{}' not found",
                normalized
            ))),
        }
    }

    /// Bind a logical name to `bucket/prefix/name`
    ///
    /// Idempotent for an identical location. A different location for an
    /// existing name fails with [`Error::Conflict`] and leaves the registry
    /// unchanged.
    pub async fn register(
        &self,
        name: &str,
        bucket: &str,
        prefix: &str,
        format: TableFormat,
    ) -> Result<TableRef> {
        let table = TableRef::with_format(name, bucket, prefix, format)?;
        self.register_table(&table).await?;
        Ok(table)
    }

    /// Register an already-built reference, same rules as [`Self::register`]
    pub async fn register_table(&self, table: &TableRef) -> Result<()> {
        let entry = TableEntry {
            table: table.clone(),
            registered_at: Utc::now(),
        };

        if self.backend.insert_table_if_absent(&entry).await? {
            info!("Registered table {}", table);
            return Ok(());
        }

        let existing = self
            .backend
            .get_table(&table.name)
            .await?
            .ok_or_else(|| {
                Error::Registry(format!(
                    "table '{}' disappeared during registration",
                    table.name
                ))
            })?;

        if existing.table.same_location(table) {
            debug!("Table '{}' already registered at the same location", table.name);
            Ok(())
        } else {
            Err(Error::Conflict(format!(
                "table '{}' is already registered at '{}', cannot register it at '{}'",
                table.name,
                existing.table.location(),
                table.location()
            )))
        }
    }

    /// Whether a name is registered
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let Ok(normalized) = normalize_table_name(name) else {
            return Ok(false);
        };
        Ok(self.backend.get_table(&normalized).await?.is_some())
    }

    /// All registered tables ordered by name
    pub async fn list(&self) -> Result<Vec<TableEntry>> {
        self.backend.list_tables().await
    }
}

impl std::fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_is_case_insensitive() {
        let registry = TableRegistry::in_memory().await.unwrap();
        registry
            .register("Sales", "lake", "raw", TableFormat::Delta)
            .await
            .unwrap();

        let table = registry.resolve("SALES").await.unwrap();
        assert_eq!(table.name, "sales");
        assert_eq!(table.location(), "lake/raw/sales");
    }

    #[tokio::test]
    async fn test_resolve_unknown_table() {
        let registry = TableRegistry::in_memory().await.unwrap();

        let err = registry.resolve("missing").await.unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
        assert_eq!(err.to_string(), "Table 'missing' not found");

        // Names that could never be registered are simply not found
        let err = registry.resolve("not a name").await.unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = TableRegistry::in_memory().await.unwrap();
        registry
            .register("sales", "lake", "raw", TableFormat::Delta)
            .await
            .unwrap();
        registry
            .register("sales", "lake", "/raw/", TableFormat::Delta)
            .await
            .unwrap();

        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_conflicting_location() {
        let registry = TableRegistry::in_memory().await.unwrap();
        registry
            .register("sales", "lake", "raw", TableFormat::Delta)
            .await
            .unwrap();

        let err = registry
            .register("sales", "lake", "curated", TableFormat::Delta)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Original binding survives
        let table = registry.resolve("sales").await.unwrap();
        assert_eq!(table.prefix, "raw");
    }

    #[tokio::test]
    async fn test_exists() {
        let registry = TableRegistry::in_memory().await.unwrap();
        assert!(!registry.exists("sales").await.unwrap());
        assert!(!registry.exists("bad name").await.unwrap());

        registry
            .register("sales", "lake", "", TableFormat::Delta)
            .await
            .unwrap();
        assert!(registry.exists("Sales").await.unwrap());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_name() {
        let registry = TableRegistry::in_memory().await.unwrap();
        let err = registry
            .register("1sales", "lake", "", TableFormat::Delta)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
