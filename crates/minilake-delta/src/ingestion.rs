//! Source ingestion into Delta tables
//!
//! An ingest runs in two phases:
//!
//! 1. [`IngestionService::prepare`] loads the source, infers its schema and
//!    validates it against the table's latest snapshot. The version it read is
//!    pinned in the returned [`PreparedIngest`].
//! 2. [`PreparedIngest::commit`] re-reads the log. If another writer committed
//!    after the pinned version the ingest fails with [`Error::WriteConflict`]
//!    and nothing is written; otherwise the data is committed as one new
//!    table version.
//!
//! Readers never observe a partial write: data files are only reachable once
//! the Delta log entry referencing them exists.
//!
//! The table is registered after its commit lands. A registration that fails
//! at that point does not undo the commit; the error names the committed
//! version.

use crate::connection::ConnectionHandle;
use crate::observability::{
    increment_ingest_errors, increment_ingest_rows, increment_write_conflicts, time_ingest,
};
use crate::snapshot::{open_latest, table_schema, uninitialized, write_error};
use crate::sql::quote_ident;
use arrow::array::{Array, ArrayRef, RecordBatch};
use arrow::datatypes::SchemaRef;
use arrow::row::{RowConverter, SortField};
use deltalake::datafusion::prelude::SessionContext;
use deltalake::parquet::basic::{Compression, ZstdLevel};
use deltalake::parquet::file::properties::WriterProperties;
use deltalake::protocol::SaveMode;
use deltalake::{DeltaOps, DeltaTable};
use minilake_core::schema::{align_batch, check_compatibility, normalize_column_name};
use minilake_core::{
    load_source, retry_async, CompressionCodec, Error, IngestReport, IngestRequest,
    IngestSettings, Result, RetryPolicy, TableRef, TableSchema, WriteMode,
};
use minilake_registry::TableRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Loads sources and commits them to Delta tables
#[derive(Clone)]
pub struct IngestionService {
    handle: ConnectionHandle,
    registry: TableRegistry,
    retry: RetryPolicy,
    settings: IngestSettings,
}

impl IngestionService {
    pub fn new(handle: ConnectionHandle, registry: TableRegistry) -> Self {
        Self {
            handle,
            registry,
            retry: RetryPolicy::default(),
            settings: IngestSettings::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_settings(mut self, settings: IngestSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Load, validate and commit `request` as one new table version
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestReport> {
        let _timer = time_ingest();
        let target = request.target.name.clone();

        let result = match self.prepare(request).await {
            Ok(prepared) => prepared.commit().await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(report) => increment_ingest_rows(report.rows_written),
            Err(err) => {
                warn!("Ingest into '{}' failed: {}", target, err);
                increment_ingest_errors();
            }
        }
        result
    }

    /// Load the source and validate it against the table's latest snapshot
    pub async fn prepare(&self, request: IngestRequest) -> Result<PreparedIngest> {
        let started = Instant::now();
        let IngestRequest {
            source,
            target,
            mode,
        } = request;
        let keys = merge_keys(&mode)?;

        info!(
            "Preparing {} ingest of {} into '{}'",
            mode,
            source.describe(),
            target.name
        );

        let settings = self.settings.clone();
        let data = tokio::task::spawn_blocking(move || load_source(&source, &settings)).await??;

        check_registration(&self.registry, &target).await?;

        let uri = self.handle.table_uri(&target);
        let storage_options = self.handle.storage_options().clone();
        let existing = load_latest(&self.retry, &uri, &storage_options).await?;

        let (schema, batches, read_version) = match &existing {
            Some(table) => {
                if mode == WriteMode::Create {
                    return Err(Error::AlreadyExists(target.name.clone()));
                }
                let schema = table_schema(table)?;
                check_compatibility(&schema, &data.schema).map_err(|e| match e {
                    Error::SchemaMismatch(msg) => Error::schema_mismatch(format!(
                        "cannot write to table '{}': {}",
                        target.name, msg
                    )),
                    other => other,
                })?;
                let batches = data
                    .batches
                    .iter()
                    .map(|batch| align_batch(batch, &schema))
                    .collect::<Result<Vec<_>>>()?;
                (schema, batches, Some(table.version()))
            }
            None => (Arc::clone(&data.schema), data.batches, None),
        };

        for key in &keys {
            if schema.index_of(key).is_err() {
                return Err(Error::invalid_input(format!(
                    "merge key '{}' is not a column of '{}'",
                    key, target.name
                )));
            }
        }
        if !keys.is_empty() {
            check_unique_keys(&schema, &batches, &keys)?;
        }

        debug!(
            "Prepared ingest into '{}': {} rows, read version {:?}",
            target.name, data.num_rows, read_version
        );

        Ok(PreparedIngest {
            registry: self.registry.clone(),
            retry: self.retry.clone(),
            compression: self.settings.compression,
            uri,
            storage_options,
            target,
            mode,
            keys,
            schema,
            batches,
            num_rows: data.num_rows,
            read_version,
            started,
        })
    }
}

/// A validated ingest waiting to be committed
pub struct PreparedIngest {
    registry: TableRegistry,
    retry: RetryPolicy,
    compression: CompressionCodec,
    uri: String,
    storage_options: HashMap<String, String>,
    target: TableRef,
    mode: WriteMode,
    keys: Vec<String>,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    num_rows: usize,
    read_version: Option<i64>,
    started: Instant,
}

impl PreparedIngest {
    pub fn target(&self) -> &TableRef {
        &self.target
    }

    /// Table version the source was validated against (`None` for a new table)
    pub fn read_version(&self) -> Option<i64> {
        self.read_version
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn schema(&self) -> TableSchema {
        TableSchema::from_arrow(&self.schema)
    }

    /// Commit the prepared data as a single new table version
    pub async fn commit(self) -> Result<IngestReport> {
        let name = self.target.name.clone();
        check_registration(&self.registry, &self.target).await?;
        let latest = load_latest(&self.retry, &self.uri, &self.storage_options).await?;

        let table = match (self.read_version, latest) {
            (Some(read), Some(table)) if table.version() == read => table,
            (Some(read), Some(table)) => {
                increment_write_conflicts();
                return Err(Error::WriteConflict(format!(
                    "table '{}' moved from version {} to {} while the ingest was prepared",
                    name,
                    read,
                    table.version()
                )));
            }
            (Some(read), None) => {
                increment_write_conflicts();
                return Err(Error::WriteConflict(format!(
                    "table '{}' at version {} disappeared before commit",
                    name, read
                )));
            }
            (None, Some(_)) if self.mode == WriteMode::Create => {
                return Err(Error::AlreadyExists(name));
            }
            (None, Some(table)) => {
                increment_write_conflicts();
                return Err(Error::WriteConflict(format!(
                    "table '{}' was created by another writer (version {})",
                    name,
                    table.version()
                )));
            }
            (None, None) => uninitialized(&self.uri, &self.storage_options)?,
        };

        let created = self.read_version.is_none();
        let properties = writer_properties(self.compression)?;
        let mut batches = self.batches;
        if batches.is_empty() {
            batches.push(RecordBatch::new_empty(Arc::clone(&self.schema)));
        }

        let (table, rows_inserted, rows_updated) = if created || self.keys.is_empty() {
            let save_mode = match (&self.mode, created) {
                (_, true) => SaveMode::ErrorIfExists,
                (WriteMode::Overwrite, false) => SaveMode::Overwrite,
                _ => SaveMode::Append,
            };
            let table = DeltaOps(table)
                .write(batches)
                .with_save_mode(save_mode)
                .with_writer_properties(properties)
                .await
                .map_err(|e| commit_error(&name, &self.mode, e))?;
            (table, self.num_rows, 0)
        } else {
            merge(table, batches, &self.schema, &self.keys, properties)
                .await
                .map_err(|e| commit_error(&name, &self.mode, e))?
        };

        let version = table.version();
        info!(
            "Committed {} ingest into '{}' at version {} ({} rows)",
            self.mode, name, version, self.num_rows
        );

        if let Err(err) = self.registry.register_table(&self.target).await {
            warn!(
                "Table '{}' committed at version {} but was not registered: {}",
                name, version, err
            );
            return Err(match err {
                Error::Conflict(msg) => Error::Conflict(format!(
                    "version {} of '{}' was committed but not registered: {}",
                    version, name, msg
                )),
                Error::Registry(msg) => Error::Registry(format!(
                    "version {} of '{}' was committed but not registered: {}",
                    version, name, msg
                )),
                other => other,
            });
        }

        Ok(IngestReport {
            table: self.target,
            mode: self.mode,
            version,
            rows_written: self.num_rows,
            rows_inserted,
            rows_updated,
            created,
            schema: TableSchema::from_arrow(&self.schema),
            duration: self.started.elapsed(),
        })
    }
}

async fn load_latest(
    retry: &RetryPolicy,
    uri: &str,
    options: &HashMap<String, String>,
) -> Result<Option<DeltaTable>> {
    retry_async(retry, "load table snapshot", || async move {
        open_latest(uri, options).await
    })
    .await
}

/// Upsert `batches` into `table`, matching rows on `keys`
async fn merge(
    table: DeltaTable,
    batches: Vec<RecordBatch>,
    schema: &SchemaRef,
    keys: &[String],
    properties: WriterProperties,
) -> deltalake::DeltaResult<(DeltaTable, usize, usize)> {
    let source = SessionContext::new().read_batches(batches)?;

    let predicate = keys
        .iter()
        .map(|k| format!("target.{0} = source.{0}", quote_ident(k)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let columns: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    let values: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| !keys.iter().any(|k| k == c))
        .collect();

    let mut builder = DeltaOps(table)
        .merge(source, predicate)
        .with_source_alias("source")
        .with_target_alias("target")
        .with_writer_properties(properties);

    if !values.is_empty() {
        builder = builder.when_matched_update(|update| {
            values.iter().fold(update, |update, column| {
                update.update(*column, format!("source.{}", quote_ident(column)))
            })
        })?;
    }
    builder = builder.when_not_matched_insert(|insert| {
        columns.iter().fold(insert, |insert, column| {
            insert.set(*column, format!("source.{}", quote_ident(column)))
        })
    })?;

    let (table, metrics) = builder.await?;
    debug!(
        "Merge touched {} file(s): {} inserted, {} updated",
        metrics.num_target_files_added, metrics.num_target_rows_inserted, metrics.num_target_rows_updated
    );
    Ok((
        table,
        metrics.num_target_rows_inserted,
        metrics.num_target_rows_updated,
    ))
}

/// Refuse to write a table whose name is registered at another location
async fn check_registration(registry: &TableRegistry, target: &TableRef) -> Result<()> {
    match registry.resolve(&target.name).await {
        Ok(registered) if !registered.same_location(target) => Err(Error::Conflict(format!(
            "table '{}' is registered at {} but the ingest targets {}",
            target.name,
            registered.location(),
            target.location()
        ))),
        Ok(_) | Err(Error::TableNotFound(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

fn commit_error(table: &str, mode: &WriteMode, err: deltalake::DeltaTableError) -> Error {
    match (write_error(table, err), mode) {
        // Losing the race to write version 0 means the table now exists
        (Error::WriteConflict(_), WriteMode::Create) => Error::AlreadyExists(table.to_string()),
        // A table created concurrently only matters as "exists" to a create
        (Error::AlreadyExists(msg), mode) if *mode != WriteMode::Create => {
            increment_write_conflicts();
            Error::WriteConflict(format!("table '{}' was created by another writer", msg))
        }
        (err @ Error::WriteConflict(_), _) => {
            increment_write_conflicts();
            err
        }
        (other, _) => other,
    }
}

/// Normalized merge keys; empty for every other mode
fn merge_keys(mode: &WriteMode) -> Result<Vec<String>> {
    let WriteMode::MergeByKey { keys } = mode else {
        return Ok(Vec::new());
    };
    if keys.iter().all(|k| k.trim().is_empty()) {
        return Err(Error::invalid_input(
            "merge-by-key requires at least one key column",
        ));
    }

    let mut normalized = Vec::with_capacity(keys.len());
    for (position, key) in keys.iter().enumerate() {
        if key.trim().is_empty() {
            continue;
        }
        let key = normalize_column_name(key, position);
        if !normalized.contains(&key) {
            normalized.push(key);
        }
    }
    Ok(normalized)
}

/// Reject sources where a merge key is null or repeated
fn check_unique_keys(schema: &SchemaRef, batches: &[RecordBatch], keys: &[String]) -> Result<()> {
    let indices = keys
        .iter()
        .map(|k| {
            schema
                .index_of(k)
                .map_err(|_| Error::invalid_input(format!("unknown merge key '{}'", k)))
        })
        .collect::<Result<Vec<_>>>()?;

    let converter = RowConverter::new(
        indices
            .iter()
            .map(|&i| SortField::new(schema.field(i).data_type().clone()))
            .collect(),
    )
    .map_err(|e| Error::internal(format!("cannot compare merge keys: {}", e)))?;

    let mut seen = HashSet::new();
    for batch in batches {
        let columns: Vec<ArrayRef> = indices.iter().map(|&i| Arc::clone(batch.column(i))).collect();
        for (column, key) in columns.iter().zip(keys) {
            if column.null_count() > 0 {
                return Err(Error::invalid_input(format!(
                    "merge key column '{}' contains nulls",
                    key
                )));
            }
        }

        let rows = converter
            .convert_columns(&columns)
            .map_err(|e| Error::internal(format!("cannot compare merge keys: {}", e)))?;
        for row in rows.iter() {
            if !seen.insert(row.owned()) {
                return Err(Error::invalid_input(format!(
                    "source contains duplicate values for merge key ({})",
                    keys.join(", ")
                )));
            }
        }
    }
    Ok(())
}

fn writer_properties(codec: CompressionCodec) -> Result<WriterProperties> {
    let zstd = |level: i32| {
        ZstdLevel::try_new(level)
            .map(Compression::ZSTD)
            .map_err(|e| Error::config(format!("invalid zstd level {}: {}", level, e)))
    };
    let compression = match codec {
        CompressionCodec::Uncompressed => Compression::UNCOMPRESSED,
        CompressionCodec::Snappy => Compression::SNAPPY,
        CompressionCodec::ZstdLevel1 => zstd(1)?,
        CompressionCodec::ZstdLevel3 => zstd(3)?,
        CompressionCodec::ZstdLevel9 => zstd(9)?,
    };
    Ok(WriterProperties::builder()
        .set_compression(compression)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use deltalake::parquet::schema::types::ColumnPath;

    fn keyed_batch(ids: Vec<Option<i64>>) -> (SchemaRef, RecordBatch) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
        ]));
        let names: Vec<Option<&str>> = ids.iter().map(|_| Some("x")).collect();
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .unwrap();
        (schema, batch)
    }

    #[test]
    fn test_merge_keys_are_normalized() {
        let keys = merge_keys(&WriteMode::merge_by_key(["Customer ID", "region", "REGION"])).unwrap();
        assert_eq!(keys, vec!["customer_id", "region"]);

        assert!(merge_keys(&WriteMode::Append).unwrap().is_empty());
    }

    #[test]
    fn test_empty_merge_keys_rejected() {
        let err = merge_keys(&WriteMode::merge_by_key(Vec::<String>::new())).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = merge_keys(&WriteMode::merge_by_key([" "])).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_unique_keys_accepted() {
        let (schema, first) = keyed_batch(vec![Some(1), Some(2)]);
        let (_, second) = keyed_batch(vec![Some(3)]);
        check_unique_keys(&schema, &[first, second], &["id".to_string()]).unwrap();
    }

    #[test]
    fn test_duplicate_keys_across_batches_rejected() {
        let (schema, first) = keyed_batch(vec![Some(1), Some(2)]);
        let (_, second) = keyed_batch(vec![Some(2)]);
        let err = check_unique_keys(&schema, &[first, second], &["id".to_string()]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_null_keys_rejected() {
        let (schema, batch) = keyed_batch(vec![Some(1), None]);
        let err = check_unique_keys(&schema, &[batch], &["id".to_string()]).unwrap_err();
        assert!(err.to_string().contains("contains nulls"));
    }

    #[test]
    fn test_writer_properties_codecs() {
        let props = writer_properties(CompressionCodec::Snappy).unwrap();
        assert_eq!(
            props.compression(&ColumnPath::from("id")),
            Compression::SNAPPY
        );

        let props = writer_properties(CompressionCodec::ZstdLevel3).unwrap();
        assert!(matches!(
            props.compression(&ColumnPath::from("id")),
            Compression::ZSTD(_)
        ));
    }

    #[test]
    fn test_commit_error_maps_concurrent_create() {
        let err = commit_error(
            "sales",
            &WriteMode::Append,
            deltalake::DeltaTableError::Generic("Delta table already exists".to_string()),
        );
        assert!(matches!(err, Error::WriteConflict(_)));

        let err = commit_error(
            "sales",
            &WriteMode::Create,
            deltalake::DeltaTableError::Generic("Delta table already exists".to_string()),
        );
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_commit_error_maps_lost_create_race() {
        let err = commit_error(
            "sales",
            &WriteMode::Create,
            deltalake::DeltaTableError::VersionAlreadyExists(0),
        );
        assert!(matches!(err, Error::AlreadyExists(ref name) if name == "sales"));

        let err = commit_error(
            "sales",
            &WriteMode::Append,
            deltalake::DeltaTableError::VersionAlreadyExists(0),
        );
        assert!(matches!(err, Error::WriteConflict(_)));
    }
}
