//! Schema inference, normalization and compatibility
//!
//! Everything in this module is pure: it works on bytes and Arrow schemas and
//! never touches storage, so the rules can be unit tested in isolation.
//!
//! ## Normalization
//!
//! Incoming columns are renamed to lower-case identifiers and their types are
//! mapped onto the set the Delta protocol can store (unsigned integers become
//! wider signed ones, all timestamps become microsecond UTC, string and binary
//! variants collapse to their basic form).
//!
//! ## Compatibility
//!
//! Writing into an existing table requires the same column names. A column type
//! may be widened on the way in (`Int32 -> Int64`, `Int64 -> Float64`,
//! `Float32 -> Float64`, `Date -> Timestamp`) but never narrowed.

use crate::config::IngestSettings;
use crate::error::{Error, Result};
use crate::types::SourceFormat;
use arrow::array::{new_null_array, ArrayRef, RecordBatch};
use arrow::compute::{cast_with_options, CastOptions};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Timezone attached to every stored timestamp
pub const UTC: &str = "UTC";

/// Coarse, engine-independent column type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Boolean,
    Integer,
    Float,
    Decimal,
    String,
    Binary,
    Date,
    Timestamp,
    Null,
    /// Anything else (nested types, intervals...), described by its Arrow name
    Other(String),
}

impl SemanticType {
    pub fn from_arrow(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean => Self::Boolean,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => Self::Integer,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => Self::Float,
            DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => Self::Decimal,
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => Self::String,
            DataType::Binary
            | DataType::LargeBinary
            | DataType::BinaryView
            | DataType::FixedSizeBinary(_) => Self::Binary,
            DataType::Date32 | DataType::Date64 => Self::Date,
            DataType::Timestamp(_, _) => Self::Timestamp,
            DataType::Null => Self::Null,
            DataType::Dictionary(_, value) => Self::from_arrow(value),
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => f.write_str("boolean"),
            Self::Integer => f.write_str("integer"),
            Self::Float => f.write_str("float"),
            Self::Decimal => f.write_str("decimal"),
            Self::String => f.write_str("string"),
            Self::Binary => f.write_str("binary"),
            Self::Date => f.write_str("date"),
            Self::Timestamp => f.write_str("timestamp"),
            Self::Null => f.write_str("null"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// Column descriptor: name, semantic type and the concrete engine type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub semantic_type: SemanticType,
    /// Concrete type as reported by Arrow (e.g. `Int64`, `Timestamp(Microsecond, Some("UTC"))`)
    pub data_type: String,
}

impl ColumnSchema {
    pub fn new(
        name: impl Into<String>,
        semantic_type: SemanticType,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            data_type: data_type.into(),
        }
    }

    pub fn from_field(field: &Field) -> Self {
        Self::new(
            field.name().clone(),
            SemanticType::from_arrow(field.data_type()),
            field.data_type().to_string(),
        )
    }
}

/// Ordered list of column descriptors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn from_arrow(schema: &Schema) -> Self {
        Self {
            columns: schema
                .fields()
                .iter()
                .map(|f| ColumnSchema::from_field(f))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

// ============================================================================
// Inference
// ============================================================================

/// Infer the normalized schema of a source payload
///
/// The format is sniffed from the content (see [`SourceFormat::sniff`]).
pub fn infer_schema(data: &[u8]) -> Result<TableSchema> {
    infer_schema_with(data, SourceFormat::sniff(data), &IngestSettings::default())
}

/// Infer the normalized schema of a payload in a known format
pub fn infer_schema_with(
    data: &[u8],
    format: SourceFormat,
    settings: &IngestSettings,
) -> Result<TableSchema> {
    let raw = crate::source::raw_schema(Bytes::copy_from_slice(data), format, settings)?;
    let normalized = normalize_schema(&raw)?;
    Ok(TableSchema::from_arrow(&normalized))
}

// ============================================================================
// Normalization
// ============================================================================

/// Lower-case identifier form of a column name
///
/// Characters outside `[a-z0-9_]` become `_`; names starting with a digit get
/// a leading `_`; blank names become `column_<position>`.
pub fn normalize_column_name(name: &str, position: usize) -> String {
    let mut normalized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    if normalized.trim_matches('_').is_empty() {
        return format!("column_{}", position + 1);
    }
    if normalized.starts_with(|c: char| c.is_ascii_digit()) {
        normalized.insert(0, '_');
    }
    normalized
}

/// Storage type for an incoming Arrow type
pub fn normalize_type(data_type: &DataType) -> Result<DataType> {
    let normalized = match data_type {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::Float32
        | DataType::Float64
        | DataType::Date32
        | DataType::Utf8
        | DataType::Binary
        | DataType::Decimal128(_, _) => data_type.clone(),
        DataType::UInt8 => DataType::Int16,
        DataType::UInt16 => DataType::Int32,
        DataType::UInt32 | DataType::UInt64 => DataType::Int64,
        DataType::Float16 => DataType::Float32,
        DataType::LargeUtf8 | DataType::Utf8View => DataType::Utf8,
        DataType::LargeBinary | DataType::BinaryView | DataType::FixedSizeBinary(_) => {
            DataType::Binary
        }
        DataType::Date64 => DataType::Date32,
        DataType::Timestamp(_, _) => {
            DataType::Timestamp(TimeUnit::Microsecond, Some(Arc::from(UTC)))
        }
        // No time-of-day type in the table format; keep the text form
        DataType::Time32(_) | DataType::Time64(_) | DataType::Null => DataType::Utf8,
        DataType::Dictionary(_, value) => normalize_type(value)?,
        DataType::List(field) => {
            DataType::List(Arc::new(normalize_field(field.name().clone(), field)?))
        }
        DataType::Struct(fields) => DataType::Struct(
            fields
                .iter()
                .map(|f| normalize_field(f.name().clone(), f))
                .collect::<Result<Vec<_>>>()?
                .into(),
        ),
        other => {
            return Err(Error::schema_mismatch(format!(
                "unsupported column type {}",
                other
            )))
        }
    };
    Ok(normalized)
}

fn normalize_field(name: String, field: &Field) -> Result<Field> {
    Ok(Field::new(name, normalize_type(field.data_type())?, true))
}

/// Rename columns and map types onto storable ones; every column is nullable
pub fn normalize_schema(schema: &Schema) -> Result<SchemaRef> {
    if schema.fields().is_empty() {
        return Err(Error::source_read("source has no columns"));
    }

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(schema.fields().len());

    for (position, field) in schema.fields().iter().enumerate() {
        let base = normalize_column_name(field.name(), position);
        let mut name = base.clone();
        let mut suffix = 2;
        while !seen.insert(name.clone()) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        let data_type = normalize_type(field.data_type()).map_err(|e| match e {
            Error::SchemaMismatch(msg) => {
                Error::schema_mismatch(format!("column '{}': {}", field.name(), msg))
            }
            other => other,
        })?;
        fields.push(Field::new(name, data_type, true));
    }

    Ok(Arc::new(Schema::new(fields)))
}

fn strict_cast() -> CastOptions<'static> {
    CastOptions {
        safe: false,
        ..Default::default()
    }
}

fn cast_column(column: &ArrayRef, target: &DataType, name: &str) -> Result<ArrayRef> {
    if column.data_type() == target {
        return Ok(Arc::clone(column));
    }
    if column.data_type() == &DataType::Null {
        return Ok(new_null_array(target, column.len()));
    }
    cast_with_options(column, target, &strict_cast()).map_err(|e| {
        Error::schema_mismatch(format!(
            "column '{}': cannot convert {} to {}: {}",
            name,
            column.data_type(),
            target,
            e
        ))
    })
}

/// Rebuild a batch positionally against a normalized schema
pub fn normalize_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    if batch.num_columns() != target.fields().len() {
        return Err(Error::internal(format!(
            "batch has {} columns but the normalized schema has {}",
            batch.num_columns(),
            target.fields().len()
        )));
    }

    let columns = batch
        .columns()
        .iter()
        .zip(target.fields().iter())
        .map(|(column, field)| cast_column(column, field.data_type(), field.name()))
        .collect::<Result<Vec<_>>>()?;

    RecordBatch::try_new(Arc::clone(target), columns)
        .map_err(|e| Error::internal(format!("failed to rebuild batch: {}", e)))
}

/// Reorder and cast a batch's columns by name to match `target`
///
/// Callers check compatibility first; a missing column here is still reported
/// as a schema mismatch.
pub fn align_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let source = batch.schema();
    let columns = target
        .fields()
        .iter()
        .map(|field| {
            let index = source.index_of(field.name()).map_err(|_| {
                Error::schema_mismatch(format!("missing column '{}'", field.name()))
            })?;
            cast_column(batch.column(index), field.data_type(), field.name())
        })
        .collect::<Result<Vec<_>>>()?;

    RecordBatch::try_new(Arc::clone(target), columns)
        .map_err(|e| Error::schema_mismatch(format!("incompatible batch: {}", e)))
}

// ============================================================================
// Compatibility
// ============================================================================

/// Whether values of `from` can be stored in a `to` column without loss of range
pub fn is_widening(from: &DataType, to: &DataType) -> bool {
    use DataType::*;

    if from == to {
        return true;
    }
    match (from, to) {
        (Null, _) => true,
        (Int8, Int16 | Int32 | Int64) | (Int16, Int32 | Int64) | (Int32, Int64) => true,
        (Int8 | Int16, Float32) => true,
        (Int8 | Int16 | Int32 | Int64, Float64) => true,
        (Float32, Float64) => true,
        (Date32, Timestamp(_, _)) => true,
        (Timestamp(_, _), Timestamp(_, _)) => true,
        (Decimal128(p1, s1), Decimal128(p2, s2)) => {
            s2 >= s1 && (*p2 as i16 - *s2 as i16) >= (*p1 as i16 - *s1 as i16)
        }
        _ => false,
    }
}

/// Check that `incoming` can be written into a table with schema `existing`
///
/// Column sets must be identical (order does not matter). Every column type
/// must be equal or a widening of the existing type.
pub fn check_compatibility(existing: &Schema, incoming: &Schema) -> Result<()> {
    let existing_names: HashSet<&str> =
        existing.fields().iter().map(|f| f.name().as_str()).collect();
    let incoming_names: HashSet<&str> =
        incoming.fields().iter().map(|f| f.name().as_str()).collect();

    let mut unexpected: Vec<&str> = incoming_names.difference(&existing_names).copied().collect();
    let mut missing: Vec<&str> = existing_names.difference(&incoming_names).copied().collect();
    unexpected.sort_unstable();
    missing.sort_unstable();

    let mut problems = Vec::new();
    if !unexpected.is_empty() {
        problems.push(format!("unexpected column(s): {}", unexpected.join(", ")));
    }
    if !missing.is_empty() {
        problems.push(format!("missing column(s): {}", missing.join(", ")));
    }

    for field in existing.fields() {
        if let Ok(incoming_field) = incoming.field_with_name(field.name()) {
            if !is_widening(incoming_field.data_type(), field.data_type()) {
                problems.push(format!(
                    "column '{}' is {} in the table but {} in the source (narrowing or incompatible)",
                    field.name(),
                    field.data_type(),
                    incoming_field.data_type()
                ));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::schema_mismatch(problems.join("; ")))
    }
}
