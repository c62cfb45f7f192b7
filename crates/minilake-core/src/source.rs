//! Source file loading
//!
//! Reads CSV, Parquet or JSON payloads into Arrow record batches with a
//! normalized schema. Loading is blocking; async callers should run it on a
//! blocking thread.

use crate::config::IngestSettings;
use crate::error::{Error, Result};
use crate::schema::{normalize_batch, normalize_schema};
use crate::types::{IngestSource, SourceFormat};
use arrow::array::RecordBatch;
use arrow::csv::reader::Format;
use arrow::datatypes::{Schema, SchemaRef};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Normalized in-memory contents of a source
#[derive(Debug, Clone)]
pub struct SourceData {
    pub format: SourceFormat,
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub num_rows: usize,
}

/// Load a source into memory
pub fn load_source(source: &IngestSource, settings: &IngestSettings) -> Result<SourceData> {
    let (data, format) = match source {
        IngestSource::Path(path) => {
            if !path.is_file() {
                return Err(Error::source_read(format!(
                    "File not found: {}",
                    path.display()
                )));
            }
            let format = SourceFormat::from_path(path)?;
            let data = std::fs::read(path).map_err(|e| {
                Error::source_read(format!("failed to read {}: {}", path.display(), e))
            })?;
            (Bytes::from(data), format)
        }
        IngestSource::Bytes { data, format } => (data.clone(), *format),
    };

    let data = read_bytes(data, format, settings)?;
    debug!(
        "Loaded {} rows in {} batches from {}",
        data.num_rows,
        data.batches.len(),
        source.describe()
    );
    Ok(data)
}

/// Parse a payload in a known format
pub fn read_bytes(data: Bytes, format: SourceFormat, settings: &IngestSettings) -> Result<SourceData> {
    let (raw_schema, batches) = match format {
        SourceFormat::Csv => read_csv(data, settings)?,
        SourceFormat::Parquet => read_parquet(data, settings)?,
        SourceFormat::Json => read_json(data, settings)?,
    };

    let schema = normalize_schema(&raw_schema)?;
    let batches = batches
        .iter()
        .filter(|b| b.num_rows() > 0)
        .map(|b| normalize_batch(b, &schema))
        .collect::<Result<Vec<_>>>()?;
    let num_rows = batches.iter().map(RecordBatch::num_rows).sum();

    Ok(SourceData {
        format,
        schema,
        batches,
        num_rows,
    })
}

/// Schema of a payload as its reader sees it, before normalization
pub(crate) fn raw_schema(data: Bytes, format: SourceFormat, settings: &IngestSettings) -> Result<Schema> {
    match format {
        SourceFormat::Csv => infer_csv_schema(&data, settings).map(|(schema, _)| schema),
        SourceFormat::Parquet => {
            let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
            Ok(builder.schema().as_ref().clone())
        }
        SourceFormat::Json => {
            let ndjson = to_ndjson(data)?;
            infer_json_schema(&ndjson, settings)
        }
    }
}

fn csv_format(settings: &IngestSettings) -> Result<Format> {
    if !settings.csv_delimiter.is_ascii() {
        return Err(Error::invalid_input(format!(
            "CSV delimiter must be a single ASCII character, got '{}'",
            settings.csv_delimiter
        )));
    }
    Ok(Format::default()
        .with_header(true)
        .with_delimiter(settings.csv_delimiter as u8))
}

fn infer_csv_schema(data: &[u8], settings: &IngestSettings) -> Result<(Schema, Format)> {
    let format = csv_format(settings)?;
    let (schema, _) = format
        .infer_schema(Cursor::new(data), settings.infer_max_records)
        .map_err(|e| Error::source_read(format!("failed to infer CSV schema: {}", e)))?;
    Ok((schema, format))
}

fn read_csv(data: Bytes, settings: &IngestSettings) -> Result<(Schema, Vec<RecordBatch>)> {
    let (schema, format) = infer_csv_schema(&data, settings)?;
    if schema.fields().is_empty() {
        return Err(Error::source_read("CSV source has no header row"));
    }

    let reader = arrow::csv::ReaderBuilder::new(Arc::new(schema.clone()))
        .with_format(format)
        .with_batch_size(settings.batch_size)
        .build(Cursor::new(data))?;

    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::source_read(format!("failed to parse CSV: {}", e)))?;
    Ok((schema, batches))
}

fn read_parquet(data: Bytes, settings: &IngestSettings) -> Result<(Schema, Vec<RecordBatch>)> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
    let schema = builder.schema().as_ref().clone();
    let reader = builder.with_batch_size(settings.batch_size).build()?;

    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::source_read(format!("failed to read Parquet: {}", e)))?;
    Ok((schema, batches))
}

/// Accept either newline-delimited JSON or a single top-level array of objects
fn to_ndjson(data: Bytes) -> Result<Bytes> {
    let first = data.iter().find(|b| !b.is_ascii_whitespace());
    if first != Some(&b'[') {
        return Ok(data);
    }

    let records: Vec<serde_json::Value> = serde_json::from_slice(&data)
        .map_err(|e| Error::source_read(format!("invalid JSON array: {}", e)))?;

    let mut out = Vec::with_capacity(data.len());
    for (i, record) in records.iter().enumerate() {
        if !record.is_object() {
            return Err(Error::source_read(format!(
                "JSON array element {} is not an object",
                i
            )));
        }
        serde_json::to_writer(&mut out, record)
            .map_err(|e| Error::internal(format!("failed to re-encode JSON: {}", e)))?;
        out.push(b'\n');
    }
    Ok(Bytes::from(out))
}

fn infer_json_schema(ndjson: &[u8], settings: &IngestSettings) -> Result<Schema> {
    let (schema, _) = arrow::json::reader::infer_json_schema_from_seekable(
        Cursor::new(ndjson),
        settings.infer_max_records,
    )
    .map_err(|e| Error::source_read(format!("failed to infer JSON schema: {}", e)))?;
    Ok(schema)
}

fn read_json(data: Bytes, settings: &IngestSettings) -> Result<(Schema, Vec<RecordBatch>)> {
    let ndjson = to_ndjson(data)?;
    let schema = infer_json_schema(&ndjson, settings)?;
    if schema.fields().is_empty() {
        return Err(Error::source_read("JSON source contains no fields"));
    }

    let reader = arrow::json::ReaderBuilder::new(Arc::new(schema.clone()))
        .with_batch_size(settings.batch_size)
        .build(Cursor::new(ndjson))?;

    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::source_read(format!("failed to parse JSON: {}", e)))?;
    Ok((schema, batches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{AsArray, Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Float64Type, Int64Type};
    use parquet::arrow::ArrowWriter;
    use tempfile::TempDir;

    fn settings() -> IngestSettings {
        IngestSettings {
            batch_size: 2,
            ..IngestSettings::default()
        }
    }

    fn parquet_bytes() -> Bytes {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("amount", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(Float64Array::from(vec![1.5, 2.5, 3.5])),
            ],
        )
        .unwrap();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        Bytes::from(buffer)
    }

    #[test]
    fn test_read_csv_batches() {
        let csv = "id,amount\n1,10.5\n2,20.25\n3,30.0\n";
        let data = read_bytes(Bytes::from(csv), SourceFormat::Csv, &settings()).unwrap();

        assert_eq!(data.num_rows, 3);
        assert_eq!(data.batches.len(), 2); // batch_size = 2
        let amounts = data.batches[0].column(1).as_primitive::<Float64Type>();
        assert_eq!(amounts.value(1), 20.25);
    }

    #[test]
    fn test_read_csv_custom_delimiter() {
        let settings = IngestSettings {
            csv_delimiter: ';',
            ..IngestSettings::default()
        };
        let data = read_bytes(Bytes::from("a;b\n1;x\n"), SourceFormat::Csv, &settings).unwrap();
        assert_eq!(data.schema.fields().len(), 2);
        assert_eq!(data.num_rows, 1);
    }

    #[test]
    fn test_read_csv_header_only() {
        let data = read_bytes(Bytes::from("id,amount\n"), SourceFormat::Csv, &settings()).unwrap();
        assert_eq!(data.num_rows, 0);
        assert!(data.batches.is_empty());
        assert_eq!(data.schema.fields().len(), 2);
    }

    #[test]
    fn test_read_parquet_normalizes_nullability() {
        let data = read_bytes(parquet_bytes(), SourceFormat::Parquet, &settings()).unwrap();
        assert_eq!(data.num_rows, 3);
        assert!(data.schema.field(0).is_nullable());
        let ids = data.batches[1].column(0).as_primitive::<Int64Type>();
        assert_eq!(ids.value(0), 3);
    }

    #[test]
    fn test_read_json_lines_and_array() {
        let lines = "{\"id\": 1, \"tag\": \"a\"}\n{\"id\": 2, \"tag\": \"b\"}\n";
        let array = r#"[{"id": 1, "tag": "a"}, {"id": 2, "tag": "b"}]"#;

        let from_lines = read_bytes(Bytes::from(lines), SourceFormat::Json, &settings()).unwrap();
        let from_array = read_bytes(Bytes::from(array), SourceFormat::Json, &settings()).unwrap();

        assert_eq!(from_lines.num_rows, 2);
        assert_eq!(from_array.num_rows, 2);
        assert_eq!(from_lines.schema, from_array.schema);
    }

    #[test]
    fn test_json_array_of_scalars_rejected() {
        let err = read_bytes(Bytes::from("[1, 2, 3]"), SourceFormat::Json, &settings()).unwrap_err();
        assert!(matches!(err, Error::SourceRead(_)));
    }

    #[test]
    fn test_load_source_missing_file() {
        let err = load_source(
            &IngestSource::path("/definitely/not/here.csv"),
            &settings(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SourceRead(_)));
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_load_source_unsupported_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("report.xlsx");
        std::fs::write(&path, b"not really excel").unwrap();

        let err = load_source(&IngestSource::path(&path), &settings()).unwrap_err();
        assert!(err.to_string().contains("Unsupported file format"));
    }

    #[test]
    fn test_load_source_corrupt_parquet() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.parquet");
        std::fs::write(&path, b"PAR1 truncated").unwrap();

        let err = load_source(&IngestSource::path(&path), &settings()).unwrap_err();
        assert!(matches!(err, Error::SourceRead(_)));
    }

    #[test]
    fn test_load_source_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sales.parquet");
        std::fs::write(&path, parquet_bytes()).unwrap();

        let data = load_source(&IngestSource::path(&path), &settings()).unwrap();
        assert_eq!(data.format, SourceFormat::Parquet);
        assert_eq!(data.num_rows, 3);
    }
}
