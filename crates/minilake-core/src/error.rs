//! Error types for minilake
//!
//! Every failure the core can report is one variant of [`Error`]. Each variant
//! carries a stable machine-readable [`ErrorCode`] plus a human-readable message
//! taken from the underlying engine or storage diagnostic where one exists.
//!
//! ## Taxonomy
//!
//! - Configuration errors fail fast and are never retried
//! - Connectivity errors (including storage write failures) may be retried
//! - Schema and validation errors must be fixed by the caller
//! - Concurrency conflicts are never retried automatically
//! - Query errors pass the engine diagnostic through verbatim

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for operations that can fail
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors that can occur in minilake
#[derive(Error, Debug)]
pub enum Error {
    /// A required credential or endpoint field is absent or malformed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The storage backend is unreachable or rejected authentication
    #[error("Connection error: {0}")]
    Connection(String),

    /// Source file missing, corrupt or in an unsupported format
    #[error("Source read error: {0}")]
    SourceRead(String),

    /// Incoming data does not fit the existing table schema
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// `create` was requested for a table that already has a committed version
    #[error("Table '{0}' already exists")]
    AlreadyExists(String),

    /// The commit failed on the storage backend; the table is unchanged
    #[error("Storage write error: {0}")]
    StorageWrite(String),

    /// A concurrent writer committed first
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// The same logical name was registered with a different location
    #[error("Registration conflict: {0}")]
    Conflict(String),

    /// Referenced table is absent from the registry or from storage
    ///
    /// When raised by the query engine the message is its diagnostic, unmodified.
    #[error("{0}")]
    TableNotFound(String),

    /// Invalid SQL syntax, engine diagnostic verbatim
    #[error("{0}")]
    QueryParse(String),

    /// Engine-level failure while executing a query, engine diagnostic verbatim
    #[error("{0}")]
    QueryExecution(String),

    /// Query exceeded its deadline and was abandoned
    #[error("Query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    /// Invalid input from the caller (bad table name, empty merge keys...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Registry storage failure
    #[error("Registry error: {0}")]
    Registry(String),

    /// Unexpected failure that indicates a bug
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConfigurationError,
    ConnectionError,
    SourceReadError,
    SchemaMismatch,
    AlreadyExists,
    StorageWriteError,
    WriteConflict,
    RegistryConflict,
    TableNotFound,
    QueryParseError,
    QueryExecutionError,
    QueryTimeout,
    InvalidInput,
    RegistryError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::SourceReadError => "SOURCE_READ_ERROR",
            Self::SchemaMismatch => "SCHEMA_MISMATCH",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::StorageWriteError => "STORAGE_WRITE_ERROR",
            Self::WriteConflict => "WRITE_CONFLICT",
            Self::RegistryConflict => "REGISTRY_CONFLICT",
            Self::TableNotFound => "TABLE_NOT_FOUND",
            Self::QueryParseError => "QUERY_PARSE_ERROR",
            Self::QueryExecutionError => "QUERY_EXECUTION_ERROR",
            Self::QueryTimeout => "QUERY_TIMEOUT",
            Self::InvalidInput => "INVALID_INPUT",
            Self::RegistryError => "REGISTRY_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad error classes, each with its own retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connectivity,
    Validation,
    Concurrency,
    Query,
    Internal,
}

impl Error {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration(_) => ErrorCode::ConfigurationError,
            Self::Connection(_) => ErrorCode::ConnectionError,
            Self::SourceRead(_) => ErrorCode::SourceReadError,
            Self::SchemaMismatch(_) => ErrorCode::SchemaMismatch,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::StorageWrite(_) => ErrorCode::StorageWriteError,
            Self::WriteConflict(_) => ErrorCode::WriteConflict,
            Self::Conflict(_) => ErrorCode::RegistryConflict,
            Self::TableNotFound(_) => ErrorCode::TableNotFound,
            Self::QueryParse(_) => ErrorCode::QueryParseError,
            Self::QueryExecution(_) => ErrorCode::QueryExecutionError,
            Self::QueryTimeout { .. } => ErrorCode::QueryTimeout,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Registry(_) => ErrorCode::RegistryError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Connection(_) | Self::StorageWrite(_) => ErrorCategory::Connectivity,
            Self::SourceRead(_)
            | Self::SchemaMismatch(_)
            | Self::AlreadyExists(_)
            | Self::InvalidInput(_) => ErrorCategory::Validation,
            Self::WriteConflict(_) | Self::Conflict(_) => ErrorCategory::Concurrency,
            Self::TableNotFound(_)
            | Self::QueryParse(_)
            | Self::QueryExecution(_)
            | Self::QueryTimeout { .. } => ErrorCategory::Query,
            Self::Registry(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether a bounded retry with backoff could succeed
    ///
    /// Only transient storage connectivity failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::StorageWrite(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn source_read(msg: impl Into<String>) -> Self {
        Self::SourceRead(msg.into())
    }

    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        Self::SchemaMismatch(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Creates a Registry error from any error type
    ///
    /// Used to convert SQLite errors coming out of the registry backend.
    pub fn registry<E: std::error::Error>(err: E) -> Self {
        Self::Registry(err.to_string())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::SourceRead(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Self::SourceRead(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {}", err))
    }
}
