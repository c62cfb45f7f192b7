//! Database schema for the table registry
//!
//! # Tables
//!
//! - **tables**: logical name to `bucket/prefix/name` location binding
//!
//! Timestamps are Unix epoch seconds. Names are stored already normalized
//! (lower-case), so the primary key enforces case-insensitive uniqueness.

use minilake_core::{Error, Result};
use rusqlite::Connection;

pub fn create_tables(db: &Connection) -> Result<()> {
    db.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tables (
            name TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            prefix TEXT NOT NULL,
            format TEXT NOT NULL,
            registered_at BIGINT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tables_location
            ON tables(bucket, prefix);
        "#,
    )
    .map_err(Error::registry)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_repeatable() {
        let db = Connection::open_in_memory().unwrap();
        create_tables(&db).unwrap();
        create_tables(&db).unwrap();

        let count: i64 = db
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'tables'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
