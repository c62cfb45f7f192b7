//! SQLite backend implementation with WAL mode
//!
//! File-backed registries use Write-Ahead Logging so several processes can
//! share one catalog. In-memory registries are for tests.

use crate::backend::RegistryBackend;
use crate::schema;
use crate::TableEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minilake_core::{recover_mutex, Error, Result, TableFormat, TableRef};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// SQLite backend with WAL mode for multi-process safety
pub struct SqliteBackend {
    db: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Create new SQLite backend from file path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy();
        if path_str == ":memory:" {
            return Self::in_memory();
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Registry(format!(
                    "failed to create registry directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(Error::registry)?;

        db.pragma_update(None, "journal_mode", "WAL")
            .map_err(Error::registry)?;
        // Wait for locks held by other processes instead of failing immediately
        db.pragma_update(None, "busy_timeout", 5000)
            .map_err(Error::registry)?;
        db.pragma_update(None, "synchronous", "NORMAL")
            .map_err(Error::registry)?;

        info!("Opened SQLite table registry at {:?} (WAL mode)", path);

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Create in-memory SQLite backend (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().map_err(Error::registry)?;
        info!("Initialized in-memory SQLite table registry");

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn into_entry(raw: (String, String, String, String, i64)) -> Result<TableEntry> {
    let (name, bucket, prefix, format, registered_at) = raw;
    let format: TableFormat = format.parse().map_err(|_| {
        Error::Registry(format!(
            "table '{}' has unknown format '{}' in registry",
            name, format
        ))
    })?;
    let table = TableRef::with_format(&name, bucket, prefix, format)?;

    Ok(TableEntry {
        table,
        registered_at: DateTime::from_timestamp(registered_at, 0).unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl RegistryBackend for SqliteBackend {
    async fn init_schema(&self) -> Result<()> {
        let db = recover_mutex(&self.db, "TableRegistry");
        schema::create_tables(&db)
    }

    async fn get_table(&self, name: &str) -> Result<Option<TableEntry>> {
        let raw = {
            let db = recover_mutex(&self.db, "TableRegistry");
            db.query_row(
                "SELECT name, bucket, prefix, format, registered_at FROM tables WHERE name = ?",
                params![name],
                entry_from_row,
            )
            .optional()
            .map_err(Error::registry)?
        };

        raw.map(into_entry).transpose()
    }

    async fn insert_table_if_absent(&self, entry: &TableEntry) -> Result<bool> {
        let db = recover_mutex(&self.db, "TableRegistry");

        let inserted = db
            .execute(
                r#"
                INSERT INTO tables (name, bucket, prefix, format, registered_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(name) DO NOTHING
                "#,
                params![
                    &entry.table.name,
                    &entry.table.bucket,
                    &entry.table.prefix,
                    entry.table.format.as_str(),
                    entry.registered_at.timestamp(),
                ],
            )
            .map_err(Error::registry)?;

        debug!(
            "Insert of table '{}' affected {} row(s)",
            entry.table.name, inserted
        );
        Ok(inserted == 1)
    }

    async fn list_tables(&self) -> Result<Vec<TableEntry>> {
        let rows = {
            let db = recover_mutex(&self.db, "TableRegistry");
            let mut stmt = db
                .prepare(
                    "SELECT name, bucket, prefix, format, registered_at FROM tables ORDER BY name",
                )
                .map_err(Error::registry)?;
            let rows = stmt
                .query_map([], entry_from_row)
                .map_err(Error::registry)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::registry)?;
            rows
        };

        rows.into_iter().map(into_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, prefix: &str) -> TableEntry {
        TableEntry {
            table: TableRef::new(name, "lake", prefix).unwrap(),
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first_row() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.init_schema().await.unwrap();

        assert!(backend
            .insert_table_if_absent(&entry("sales", "raw"))
            .await
            .unwrap());
        assert!(!backend
            .insert_table_if_absent(&entry("sales", "curated"))
            .await
            .unwrap());

        let stored = backend.get_table("sales").await.unwrap().unwrap();
        assert_eq!(stored.table.prefix, "raw");
    }

    #[tokio::test]
    async fn test_get_missing_table() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.init_schema().await.unwrap();

        assert!(backend.get_table("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_tables_sorted() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.init_schema().await.unwrap();
        for name in ["orders", "customers", "events"] {
            backend
                .insert_table_if_absent(&entry(name, ""))
                .await
                .unwrap();
        }

        let names: Vec<String> = backend
            .list_tables()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.table.name)
            .collect();
        assert_eq!(names, vec!["customers", "events", "orders"]);
    }

    #[tokio::test]
    async fn test_file_backed_registry_creates_parent_dir() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("registry.db");

        let backend = SqliteBackend::new(&path).unwrap();
        backend.init_schema().await.unwrap();

        assert!(path.exists());
    }
}
