//! Core data types shared by the registry, ingestion and query components

use crate::error::{Error, Result};
use crate::schema::{ColumnSchema, TableSchema};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Tables
// ============================================================================

/// On-disk table format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    #[default]
    Delta,
}

impl TableFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delta => "delta",
        }
    }
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "delta" => Ok(Self::Delta),
            other => Err(Error::invalid_input(format!(
                "unsupported table format '{}'",
                other
            ))),
        }
    }
}

/// Logical table name bound to a physical location
///
/// Data lives under `bucket/prefix/name/`. The name is also the identifier
/// SQL uses to reference the table, so it must be a plain lower-case identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub bucket: String,
    pub prefix: String,
    #[serde(default)]
    pub format: TableFormat,
}

impl TableRef {
    /// Delta table reference; the name is lower-cased and validated
    pub fn new(
        name: impl AsRef<str>,
        bucket: impl Into<String>,
        prefix: impl AsRef<str>,
    ) -> Result<Self> {
        Self::with_format(name, bucket, prefix, TableFormat::Delta)
    }

    pub fn with_format(
        name: impl AsRef<str>,
        bucket: impl Into<String>,
        prefix: impl AsRef<str>,
        format: TableFormat,
    ) -> Result<Self> {
        let name = normalize_table_name(name.as_ref())?;
        let bucket = bucket.into();
        if bucket.trim().is_empty() || bucket.contains('/') {
            return Err(Error::invalid_input(format!(
                "invalid bucket '{}' for table '{}'",
                bucket, name
            )));
        }
        let prefix = prefix.as_ref().trim_matches('/').to_string();
        if prefix.split('/').any(|part| part == "." || part == "..") {
            return Err(Error::invalid_input(format!(
                "invalid prefix '{}' for table '{}'",
                prefix, name
            )));
        }

        Ok(Self {
            name,
            bucket,
            prefix,
            format,
        })
    }

    /// `bucket/prefix/name`, without scheme
    pub fn location(&self) -> String {
        if self.prefix.is_empty() {
            format!("{}/{}", self.bucket, self.name)
        } else {
            format!("{}/{}/{}", self.bucket, self.prefix, self.name)
        }
    }

    /// Same bucket, prefix and format
    pub fn same_location(&self, other: &TableRef) -> bool {
        self.bucket == other.bucket && self.prefix == other.prefix && self.format == other.format
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.name, self.format, self.location())
    }
}

/// Validate and lower-case a logical table name
///
/// Names must start with a letter or underscore and contain only ASCII
/// letters, digits and underscores.
pub fn normalize_table_name(name: &str) -> Result<String> {
    let name = name.trim();
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if !valid || name.len() > 128 {
        return Err(Error::invalid_input(format!(
            "invalid table name '{}': use letters, digits and underscores, starting with a letter",
            name
        )));
    }
    Ok(name.to_ascii_lowercase())
}

// ============================================================================
// Ingestion
// ============================================================================

/// Source file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Parquet,
    Json,
}

impl SourceFormat {
    /// Format implied by a file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "csv" | "txt" => Ok(Self::Csv),
            "parquet" | "pq" => Ok(Self::Parquet),
            "json" | "jsonl" | "ndjson" => Ok(Self::Json),
            _ => Err(Error::source_read(format!(
                "Unsupported file format: '.{}' ({})",
                extension,
                path.display()
            ))),
        }
    }

    /// Guess the format from file content
    ///
    /// Parquet files start with the `PAR1` magic, JSON documents with `{` or
    /// `[`; anything else is treated as delimited text.
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(b"PAR1") {
            return Self::Parquet;
        }
        match data.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => Self::Json,
            _ => Self::Csv,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
            Self::Json => "json",
        };
        f.write_str(s)
    }
}

/// Where ingested data comes from
#[derive(Debug, Clone)]
pub enum IngestSource {
    /// File on the local filesystem; format taken from its extension
    Path(PathBuf),
    /// In-memory payload with an explicit format
    Bytes { data: Bytes, format: SourceFormat },
}

impl IngestSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn bytes(data: impl Into<Bytes>, format: SourceFormat) -> Self {
        Self::Bytes {
            data: data.into(),
            format,
        }
    }

    /// Short description for logs and error messages
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes { data, format } => format!("<{} bytes of {}>", data.len(), format),
        }
    }
}

/// How an ingest interacts with existing table data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// Fail if the table has any committed version
    Create,
    /// Add rows to the table (creating it if needed)
    Append,
    /// Atomically replace all rows; history keeps prior versions
    Overwrite,
    /// Upsert by key: matching rows replaced, others inserted
    MergeByKey { keys: Vec<String> },
}

impl WriteMode {
    pub fn merge_by_key<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::MergeByKey {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Append => "append",
            Self::Overwrite => "overwrite",
            Self::MergeByKey { .. } => "merge-by-key",
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MergeByKey { keys } => write!(f, "merge-by-key({})", keys.join(", ")),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for WriteMode {
    type Err = Error;

    /// Accepts `create`, `append`, `overwrite` and `merge-by-key:<k1>,<k2>`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "create" => return Ok(Self::Create),
            "append" => return Ok(Self::Append),
            "overwrite" => return Ok(Self::Overwrite),
            _ => {}
        }

        match s.split_once(':') {
            Some((mode, keys)) if mode.eq_ignore_ascii_case("merge-by-key") => {
                let keys: Vec<String> = keys
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect();
                if keys.is_empty() {
                    return Err(Error::invalid_input("merge-by-key requires at least one key"));
                }
                Ok(Self::MergeByKey { keys })
            }
            _ => Err(Error::invalid_input(format!(
                "unknown write mode '{}' (expected create, append, overwrite or merge-by-key:<keys>)",
                s
            ))),
        }
    }
}

/// A single ingestion call
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source: IngestSource,
    pub target: TableRef,
    pub mode: WriteMode,
}

impl IngestRequest {
    pub fn new(source: IngestSource, target: TableRef, mode: WriteMode) -> Self {
        Self {
            source,
            target,
            mode,
        }
    }

    pub fn from_path(path: impl Into<PathBuf>, target: TableRef, mode: WriteMode) -> Self {
        Self::new(IngestSource::path(path), target, mode)
    }
}

/// Outcome of a committed ingest
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub table: TableRef,
    pub mode: WriteMode,
    /// Table version produced by the commit
    pub version: i64,
    /// Rows read from the source
    pub rows_written: usize,
    /// Rows added by a merge (equals `rows_written` for other modes)
    pub rows_inserted: usize,
    /// Rows replaced by a merge
    pub rows_updated: usize,
    /// Whether this ingest created the table
    pub created: bool,
    pub schema: TableSchema,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

// ============================================================================
// Query results
// ============================================================================

/// A typed cell value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value as f64 (integers are widened)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
            Self::Date(v) => write!(f, "{}", v),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Binary(v) => {
                for byte in v {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// Fully materialized result of a SQL query
///
/// Every row holds exactly one value per column, in column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnSchema>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<ColumnSchema>, rows: Vec<Vec<Value>>) -> Result<Self> {
        if let Some(bad) = rows.iter().position(|row| row.len() != columns.len()) {
            return Err(Error::internal(format!(
                "row {} has {} values but the result has {} columns",
                bad,
                rows[bad].len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    /// Value at `row` in the named column
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }

    /// Single value of a one-row, one-column result (e.g. `SELECT COUNT(*)`)
    pub fn scalar(&self) -> Option<&Value> {
        match (self.rows.as_slice(), self.columns.len()) {
            ([row], 1) => row.first(),
            _ => None,
        }
    }

    /// Rows as column-name to value maps
    pub fn records(&self) -> impl Iterator<Item = HashMap<&str, &Value>> + '_ {
        self.rows.iter().map(move |row| {
            self.columns
                .iter()
                .map(|c| c.name.as_str())
                .zip(row.iter())
                .collect()
        })
    }
}

// ============================================================================
// Table metadata
// ============================================================================

/// One entry of a table's commit history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitSummary {
    pub version: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub operation: Option<String>,
    pub parameters: HashMap<String, String>,
}

/// Snapshot metadata for a table
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub table: TableRef,
    pub uri: String,
    pub version: i64,
    pub schema: TableSchema,
    pub file_count: usize,
    pub history: Vec<CommitSummary>,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
