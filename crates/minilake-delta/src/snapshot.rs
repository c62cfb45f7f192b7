//! Delta table loading and delta-rs error classification
//!
//! Every read goes through [`open_latest`], [`open_version`] or [`open_as_of`],
//! which load the transaction log afresh; nothing here caches table state
//! between calls.

use arrow::datatypes::SchemaRef;
use chrono::{DateTime, Utc};
use deltalake::delta_datafusion::DataFusionMixins;
use deltalake::operations::transaction::TransactionError;
use deltalake::table::builder::ensure_table_uri;
use deltalake::{DeltaTable, DeltaTableBuilder, DeltaTableError};
use minilake_core::schema::normalize_schema;
use minilake_core::{CommitSummary, Error, Result};
use std::collections::HashMap;
use tracing::debug;

fn builder(uri: &str, options: &HashMap<String, String>) -> Result<DeltaTableBuilder> {
    let url = ensure_table_uri(uri).map_err(read_error)?;
    Ok(DeltaTableBuilder::from_valid_uri(url)
        .map_err(read_error)?
        .with_storage_options(options.clone()))
}

fn is_missing_table(err: &DeltaTableError) -> bool {
    matches!(
        err,
        DeltaTableError::NotATable { .. } | DeltaTableError::InvalidTableLocation { .. }
    )
}

/// Latest committed snapshot, or `None` when nothing was ever committed at `uri`
pub async fn open_latest(uri: &str, options: &HashMap<String, String>) -> Result<Option<DeltaTable>> {
    match builder(uri, options)?.load().await {
        Ok(table) => {
            debug!("Loaded {} at version {}", uri, table.version());
            Ok(Some(table))
        }
        Err(err) if is_missing_table(&err) => Ok(None),
        Err(err) => Err(read_error(err)),
    }
}

/// Snapshot at an exact committed version
pub async fn open_version(
    uri: &str,
    options: &HashMap<String, String>,
    version: i64,
) -> Result<Option<DeltaTable>> {
    match builder(uri, options)?.with_version(version).load().await {
        Ok(table) => Ok(Some(table)),
        Err(err) if is_missing_table(&err) => Ok(None),
        Err(DeltaTableError::InvalidVersion { .. }) => Err(Error::invalid_input(format!(
            "version {} does not exist for {}",
            version, uri
        ))),
        Err(err) => Err(read_error(err)),
    }
}

/// Snapshot of the newest version committed at or before `at`
///
/// A time before the table's first commit is an [`Error::InvalidInput`].
pub async fn open_as_of(
    uri: &str,
    options: &HashMap<String, String>,
    at: DateTime<Utc>,
) -> Result<Option<DeltaTable>> {
    let Some(latest) = open_latest(uri, options).await? else {
        return Ok(None);
    };

    let commits = usize::try_from(latest.version() + 1).unwrap_or(1);
    let version = commit_history(&latest, commits)
        .await?
        .into_iter()
        .find(|commit| commit.timestamp.is_some_and(|ts| ts <= at))
        .map(|commit| commit.version)
        .ok_or_else(|| {
            Error::invalid_input(format!(
                "no version of {} was committed at or before {}",
                uri,
                at.to_rfc3339()
            ))
        })?;

    debug!("Resolved {} as of {} to version {}", uri, at.to_rfc3339(), version);
    if version == latest.version() {
        return Ok(Some(latest));
    }
    open_version(uri, options, version).await
}

/// Unloaded handle for a table that has no committed version yet
pub fn uninitialized(uri: &str, options: &HashMap<String, String>) -> Result<DeltaTable> {
    builder(uri, options)?.build().map_err(read_error)
}

/// Active data file URIs of a snapshot
pub fn data_files(table: &DeltaTable) -> Result<Vec<String>> {
    Ok(table.get_file_uris().map_err(read_error)?.collect())
}

/// Arrow schema of a snapshot, in the normalized form ingestion writes
pub fn table_schema(table: &DeltaTable) -> Result<SchemaRef> {
    let schema = table
        .snapshot()
        .map_err(read_error)?
        .arrow_schema()
        .map_err(read_error)?;
    normalize_schema(&schema)
}

/// Most recent commits of a snapshot, newest first
pub async fn commit_history(table: &DeltaTable, limit: usize) -> Result<Vec<CommitSummary>> {
    let latest = table.version();
    let commits = table.history(Some(limit)).await.map_err(read_error)?;

    Ok(commits
        .into_iter()
        .enumerate()
        .map(|(offset, commit)| CommitSummary {
            version: latest - offset as i64,
            timestamp: commit.timestamp.and_then(DateTime::from_timestamp_millis),
            operation: commit.operation,
            parameters: commit
                .operation_parameters
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| {
                    let value = value
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| value.to_string());
                    (key, value)
                })
                .collect(),
        })
        .collect())
}

/// Map a failure while reading the log or listing storage
pub fn read_error(err: DeltaTableError) -> Error {
    match err {
        DeltaTableError::ObjectStore { .. } | DeltaTableError::Io { .. } => {
            Error::connection(err.to_string())
        }
        other => Error::internal(format!("failed to read Delta table: {}", other)),
    }
}

/// Map a failure while writing or committing
pub fn write_error(table: &str, err: DeltaTableError) -> Error {
    match err {
        DeltaTableError::Transaction { source } => match source {
            TransactionError::ObjectStore { .. } => Error::StorageWrite(source.to_string()),
            conflict => Error::WriteConflict(format!(
                "concurrent commit on table '{}': {}",
                table, conflict
            )),
        },
        DeltaTableError::VersionAlreadyExists { .. } => Error::WriteConflict(format!(
            "concurrent commit on table '{}': {}",
            table, err
        )),
        DeltaTableError::SchemaMismatch { .. } => Error::schema_mismatch(err.to_string()),
        DeltaTableError::Generic(ref msg) if msg.to_lowercase().contains("already exists") => {
            Error::AlreadyExists(table.to_string())
        }
        other => Error::StorageWrite(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_latest_on_empty_location() {
        let temp_dir = TempDir::new().unwrap();
        let uri = temp_dir.path().join("lake").join("missing");

        let table = open_latest(&uri.to_string_lossy(), &HashMap::new())
            .await
            .unwrap();
        assert!(table.is_none());
    }

    #[test]
    fn test_write_error_classification() {
        let err = write_error("sales", DeltaTableError::VersionAlreadyExists(3));
        assert!(matches!(err, Error::WriteConflict(_)));

        let err = write_error(
            "sales",
            DeltaTableError::SchemaMismatch {
                msg: "extra column".to_string(),
            },
        );
        assert!(matches!(err, Error::SchemaMismatch(_)));

        let err = write_error("sales", DeltaTableError::Generic("boom".to_string()));
        assert!(matches!(err, Error::StorageWrite(_)));
    }
}
