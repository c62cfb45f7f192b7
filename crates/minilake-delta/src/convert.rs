//! Arrow result batches to typed rows
//!
//! Engine types are collapsed onto the [`Value`] variants: every integer width
//! becomes `Int`, every float width `Float`. Decimals with scale 0 that fit in
//! an `i64` become `Int`, other decimals `Float`. Types without a dedicated
//! variant are rendered as text.

use chrono::DateTime;
use duckdb::arrow::array::{Array, ArrayRef, AsArray, RecordBatch};
use duckdb::arrow::compute::{cast_with_options, CastOptions};
use duckdb::arrow::datatypes::{
    DataType, Date32Type, Field, Float64Type, Int64Type, Schema, TimeUnit,
    TimestampMicrosecondType,
};
use duckdb::arrow::util::display::{ArrayFormatter, FormatOptions};
use minilake_core::{ColumnSchema, Error, QueryResult, Result, Value};
use std::sync::Arc;

fn strict() -> CastOptions<'static> {
    CastOptions {
        safe: false,
        ..Default::default()
    }
}

fn utc_micros() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some(Arc::from("UTC")))
}

/// Type a column is converted through before values are extracted
fn value_type(field: &Field, batches: &[RecordBatch], index: usize) -> DataType {
    match field.data_type() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => DataType::Int64,
        // UInt64 may not fit; checked below like scale-0 decimals
        DataType::UInt64 | DataType::Decimal128(_, 0) | DataType::Decimal256(_, 0) => {
            let fits = batches
                .iter()
                .all(|b| cast_with_options(b.column(index), &DataType::Int64, &strict()).is_ok());
            if fits {
                DataType::Int64
            } else {
                DataType::Float64
            }
        }
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => DataType::Float64,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => DataType::Utf8,
        DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_) => DataType::Binary,
        DataType::Date32 | DataType::Date64 => DataType::Date32,
        DataType::Timestamp(_, _) => utc_micros(),
        DataType::Boolean | DataType::Null => field.data_type().clone(),
        // Rendered as text
        _ => DataType::Utf8,
    }
}

fn column_values(array: &ArrayRef, target: &DataType) -> Result<Vec<Value>> {
    let convert_err = |e: duckdb::arrow::error::ArrowError| {
        Error::QueryExecution(format!("failed to convert result column: {}", e))
    };

    let values = match target {
        DataType::Null => vec![Value::Null; array.len()],
        DataType::Boolean => array
            .as_boolean()
            .iter()
            .map(|v| v.map_or(Value::Null, Value::Boolean))
            .collect(),
        DataType::Int64 => {
            let cast = cast_with_options(array, target, &strict()).map_err(convert_err)?;
            cast.as_primitive::<Int64Type>()
                .iter()
                .map(|v| v.map_or(Value::Null, Value::Int))
                .collect()
        }
        DataType::Float64 => {
            let cast =
                cast_with_options(array, target, &CastOptions::default()).map_err(convert_err)?;
            cast.as_primitive::<Float64Type>()
                .iter()
                .map(|v| v.map_or(Value::Null, Value::Float))
                .collect()
        }
        DataType::Date32 => {
            let cast = cast_with_options(array, target, &strict()).map_err(convert_err)?;
            let dates = cast.as_primitive::<Date32Type>();
            (0..dates.len())
                .map(|i| {
                    if dates.is_null(i) {
                        Value::Null
                    } else {
                        dates.value_as_date(i).map_or(Value::Null, Value::Date)
                    }
                })
                .collect()
        }
        DataType::Timestamp(_, _) => {
            let cast = cast_with_options(array, target, &strict()).map_err(convert_err)?;
            cast.as_primitive::<TimestampMicrosecondType>()
                .iter()
                .map(|v| {
                    v.and_then(DateTime::from_timestamp_micros)
                        .map_or(Value::Null, Value::Timestamp)
                })
                .collect()
        }
        DataType::Binary => {
            let cast = cast_with_options(array, target, &strict()).map_err(convert_err)?;
            cast.as_binary::<i32>()
                .iter()
                .map(|v| v.map_or(Value::Null, |b| Value::Binary(b.to_vec())))
                .collect()
        }
        DataType::Utf8 if matches!(
            array.data_type(),
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View
        ) =>
        {
            let cast = cast_with_options(array, target, &strict()).map_err(convert_err)?;
            cast.as_string::<i32>()
                .iter()
                .map(|v| v.map_or(Value::Null, |s| Value::Text(s.to_string())))
                .collect()
        }
        _ => {
            let formatter = ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default())
                .map_err(convert_err)?;
            (0..array.len())
                .map(|i| {
                    if array.is_null(i) {
                        Value::Null
                    } else {
                        Value::Text(formatter.value(i).to_string())
                    }
                })
                .collect()
        }
    };
    Ok(values)
}

/// Materialize engine output into a [`QueryResult`]
pub fn to_query_result(schema: &Schema, batches: &[RecordBatch]) -> Result<QueryResult> {
    let targets: Vec<DataType> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(index, field)| value_type(field, batches, index))
        .collect();

    let columns: Vec<ColumnSchema> = schema
        .fields()
        .iter()
        .zip(&targets)
        .map(|(field, target)| {
            ColumnSchema::from_field(&Field::new(field.name(), target.clone(), true))
        })
        .collect();

    let total_rows = batches.iter().map(RecordBatch::num_rows).sum();
    let mut rows: Vec<Vec<Value>> = Vec::with_capacity(total_rows);

    for batch in batches {
        let mut converted: Vec<std::vec::IntoIter<Value>> = batch
            .columns()
            .iter()
            .zip(&targets)
            .map(|(array, target)| column_values(array, target).map(Vec::into_iter))
            .collect::<Result<_>>()?;

        for _ in 0..batch.num_rows() {
            let row = converted
                .iter_mut()
                .map(|column| column.next().unwrap_or(Value::Null))
                .collect();
            rows.push(row);
        }
    }

    QueryResult::new(columns, rows)
}
