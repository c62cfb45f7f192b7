//! Table maintenance: commit history, vacuum and file compaction

use crate::connection::ConnectionHandle;
use crate::snapshot::{commit_history, open_latest, write_error};
use deltalake::operations::optimize::OptimizeType;
use deltalake::{DeltaOps, DeltaTable};
use minilake_core::schema::normalize_column_name;
use minilake_core::{retry_async, CommitSummary, Error, Result, RetryPolicy};
use minilake_registry::TableRegistry;
use serde::Serialize;
use tracing::{info, warn};

/// Shortest retention vacuum accepts; younger files may still back readable versions
pub const MIN_RETENTION_HOURS: u64 = 168;

/// Outcome of a vacuum
#[derive(Debug, Clone, Serialize)]
pub struct VacuumReport {
    pub table: String,
    pub retention_hours: u64,
    pub dry_run: bool,
    /// Files deleted, or that would be deleted on a dry run
    pub files: Vec<String>,
}

/// Outcome of a compaction or Z-order run
#[derive(Debug, Clone, Serialize)]
pub struct OptimizeReport {
    pub table: String,
    pub version: i64,
    pub files_added: u64,
    pub files_removed: u64,
}

/// History, vacuum and optimize for registered tables
#[derive(Clone)]
pub struct TableMaintenance {
    handle: ConnectionHandle,
    registry: TableRegistry,
    retry: RetryPolicy,
}

impl TableMaintenance {
    pub fn new(handle: ConnectionHandle, registry: TableRegistry) -> Self {
        Self {
            handle,
            registry,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn load(&self, name: &str) -> Result<(String, DeltaTable)> {
        let table = self.registry.resolve(name).await?;
        let uri = self.handle.table_uri(&table);
        let options = self.handle.storage_options().clone();

        let snapshot = retry_async(&self.retry, "load table snapshot", || {
            let uri = uri.clone();
            let options = options.clone();
            async move { open_latest(&uri, &options).await }
        })
        .await?
        .ok_or_else(|| {
            Error::TableNotFound(format!(
                "Table '{}' is registered but has no committed data at {}",
                table.name, uri
            ))
        })?;

        Ok((table.name, snapshot))
    }

    /// Up to `limit` most recent commits, newest first
    pub async fn history(&self, name: &str, limit: usize) -> Result<Vec<CommitSummary>> {
        let (_, table) = self.load(name).await?;
        commit_history(&table, limit.max(1)).await
    }

    /// Delete data files no longer referenced by any version within the retention window
    ///
    /// Retention below [`MIN_RETENTION_HOURS`] is raised to it.
    pub async fn vacuum(&self, name: &str, retention_hours: u64, dry_run: bool) -> Result<VacuumReport> {
        let (name, table) = self.load(name).await?;

        let hours = if retention_hours < MIN_RETENTION_HOURS {
            warn!(
                "Vacuum retention of {}h for '{}' raised to {}h",
                retention_hours, name, MIN_RETENTION_HOURS
            );
            MIN_RETENTION_HOURS
        } else {
            retention_hours
        };
        let period = i64::try_from(hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .ok_or_else(|| Error::invalid_input(format!("retention of {}h is too large", hours)))?;

        let (_, metrics) = DeltaOps(table)
            .vacuum()
            .with_retention_period(period)
            .with_dry_run(dry_run)
            .await
            .map_err(|e| write_error(&name, e))?;

        info!(
            "Vacuum of '{}' {} {} file(s)",
            name,
            if dry_run { "would delete" } else { "deleted" },
            metrics.files_deleted.len()
        );

        Ok(VacuumReport {
            table: name,
            retention_hours: hours,
            dry_run,
            files: metrics.files_deleted,
        })
    }

    /// Compact small files, or Z-order by `zorder_by` when it is non-empty
    pub async fn optimize(&self, name: &str, zorder_by: &[String]) -> Result<OptimizeReport> {
        let (name, table) = self.load(name).await?;

        let optimize_type = if zorder_by.is_empty() {
            OptimizeType::Compact
        } else {
            let columns: Vec<String> = zorder_by
                .iter()
                .enumerate()
                .map(|(position, column)| normalize_column_name(column, position))
                .collect();
            let schema = table.get_schema().map_err(|e| write_error(&name, e))?;
            if let Some(missing) = columns.iter().find(|c| schema.field(c.as_str()).is_none()) {
                return Err(Error::invalid_input(format!(
                    "Z-order column '{}' is not a column of '{}'",
                    missing, name
                )));
            }
            OptimizeType::ZOrder(columns)
        };

        let (table, metrics) = DeltaOps(table)
            .optimize()
            .with_type(optimize_type)
            .await
            .map_err(|e| write_error(&name, e))?;

        info!(
            "Optimized '{}': {} file(s) added, {} removed",
            name, metrics.num_files_added, metrics.num_files_removed
        );

        Ok(OptimizeReport {
            table: name,
            version: table.version(),
            files_added: metrics.num_files_added,
            files_removed: metrics.num_files_removed,
        })
    }
}
