//! SQL helpers: identifier quoting, table reference extraction, type names

use arrow::datatypes::DataType;
use sqlparser::ast::visit_relations;
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::ops::ControlFlow;

/// Double-quoted identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quoted string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Unqualified relation names referenced by `sql`, lower-cased and deduplicated
///
/// Returns `None` when the statement cannot be parsed; callers then leave the
/// diagnosis to the engine. CTE names and table functions show up here too,
/// so the result is a superset of the registered tables the query touches.
pub fn referenced_tables(sql: &str) -> Option<Vec<String>> {
    let statements = Parser::parse_sql(&DuckDbDialect {}, sql).ok()?;

    let mut names = BTreeSet::new();
    let _ = visit_relations(&statements, |relation| {
        if let [ident] = relation.0.as_slice() {
            names.insert(ident.value.to_lowercase());
        }
        ControlFlow::<()>::Continue(())
    });

    Some(names.into_iter().collect())
}

/// DuckDB type name for a table column type
pub fn duckdb_type(data_type: &DataType) -> String {
    match data_type {
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Int8 => "TINYINT".to_string(),
        DataType::Int16 => "SMALLINT".to_string(),
        DataType::Int32 => "INTEGER".to_string(),
        DataType::Int64 => "BIGINT".to_string(),
        DataType::Float32 => "FLOAT".to_string(),
        DataType::Float64 => "DOUBLE".to_string(),
        DataType::Decimal128(precision, scale) => format!("DECIMAL({}, {})", precision, scale),
        DataType::Date32 | DataType::Date64 => "DATE".to_string(),
        DataType::Timestamp(_, Some(_)) => "TIMESTAMPTZ".to_string(),
        DataType::Timestamp(_, None) => "TIMESTAMP".to_string(),
        DataType::Binary | DataType::LargeBinary => "BLOB".to_string(),
        _ => "VARCHAR".to_string(),
    }
}
