//! Registry backend trait
//!
//! The registry persists logical table names and their physical locations.
//! Backends only store rows; the idempotency and conflict rules live in
//! [`crate::TableRegistry`].

use crate::TableEntry;
use async_trait::async_trait;
use minilake_core::{RegistrySettings, Result};

/// Registry backend trait for storage operations
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Initialize schema (create tables, indexes)
    async fn init_schema(&self) -> Result<()>;

    /// Look up a table by its normalized name
    async fn get_table(&self, name: &str) -> Result<Option<TableEntry>>;

    /// Insert an entry unless the name is already taken
    ///
    /// Returns `false` when a row with the same name already existed; the
    /// existing row is left untouched.
    async fn insert_table_if_absent(&self, entry: &TableEntry) -> Result<bool>;

    /// All entries ordered by name
    async fn list_tables(&self) -> Result<Vec<TableEntry>>;
}

/// Configuration for registry backend
#[derive(Debug, Clone)]
pub enum RegistryConfig {
    /// SQLite with WAL mode (embedded, multi-process safe)
    SQLite {
        /// Path to SQLite database file, or ":memory:"
        path: String,
    },
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&RegistrySettings::default())
    }
}

impl RegistryConfig {
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self::SQLite { path: path.into() }
    }
}

impl From<&RegistrySettings> for RegistryConfig {
    fn from(settings: &RegistrySettings) -> Self {
        Self::sqlite(settings.path.clone())
    }
}
