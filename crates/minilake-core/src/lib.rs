//! # minilake core
//!
//! Shared foundation for the minilake crates: the error taxonomy, storage and
//! engine configuration, retry policy, source loading and schema handling.
//!
//! Nothing in this crate talks to object storage or the query engine. That
//! lives in `minilake-delta`; the logical table catalog lives in
//! `minilake-registry`.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use minilake_core::prelude::*;
//!
//! let config = StorageConfig::from_env()?;
//! let table = TableRef::new("sales", config.primary_bucket()?, config.prefix())?;
//! let request = IngestRequest::from_path("data/sales.csv", table, WriteMode::Append);
//!
//! let schema = minilake_core::infer_schema(&std::fs::read("data/sales.csv")?)?;
//! println!("{} columns", schema.len());
//! ```

pub use config::{
    CompressionCodec, EngineConfig, IngestSettings, MinilakeConfig, QuerySettings,
    RegistrySettings, S3Settings, StorageBackend, StorageConfig,
};
pub use error::{Error, ErrorCategory, ErrorCode, Result};
pub use retry::{retry_async, RetryPolicy};
pub use schema::{infer_schema, infer_schema_with, ColumnSchema, SemanticType, TableSchema};
pub use source::{load_source, SourceData};
pub use types::{
    CommitSummary, IngestReport, IngestRequest, IngestSource, QueryResult, SourceFormat,
    TableFormat, TableInfo, TableRef, Value, WriteMode,
};

pub mod config;
pub mod error;
pub mod retry;
pub mod schema;
pub mod source;
pub mod types;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked
///
/// The guarded state in minilake (SQLite and DuckDB handles) stays usable after
/// a panic in an unrelated caller, so poisoning is logged and ignored.
pub fn recover_mutex<'a, T>(mutex: &'a Mutex<T>, name: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("{} mutex was poisoned, recovering", name);
        poisoned.into_inner()
    })
}

pub mod prelude {
    pub use crate::config::{MinilakeConfig, StorageConfig};
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::retry::RetryPolicy;
    pub use crate::schema::{ColumnSchema, TableSchema};
    pub use crate::types::{
        IngestReport, IngestRequest, IngestSource, QueryResult, TableRef, Value, WriteMode,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recover_mutex_after_panic() {
        let mutex = Arc::new(Mutex::new(5));
        let clone = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*recover_mutex(&mutex, "test"), 5);
    }
}
