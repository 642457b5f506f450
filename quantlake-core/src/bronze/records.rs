//! JSON records ⇄ DataFrame.
//!
//! API records are stored in bronze as flat columns. Scalar fields keep a
//! native type (Int64, Float64, Boolean, String); nested objects and arrays
//! are stored as JSON text so nothing is lost and the schema stays flat.

use super::BronzeError;
use polars::prelude::*;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inferred {
    Boolean,
    Int64,
    Float64,
    String,
}

fn infer(values: &[Option<&Value>]) -> Inferred {
    let mut seen_bool = false;
    let mut seen_int = false;
    let mut seen_float = false;
    for v in values.iter().flatten() {
        match v {
            Value::Null => {}
            Value::Bool(_) => seen_bool = true,
            Value::Number(n) if n.is_i64() => seen_int = true,
            Value::Number(_) => seen_float = true,
            _ => return Inferred::String,
        }
    }
    match (seen_bool, seen_int, seen_float) {
        (true, false, false) => Inferred::Boolean,
        (false, true, false) => Inferred::Int64,
        (false, _, true) => Inferred::Float64,
        (false, false, false) => Inferred::String,
        _ => Inferred::String,
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Build a frame from JSON objects. Columns appear in first-seen order.
pub fn records_to_dataframe(records: &[Value]) -> Result<DataFrame, BronzeError> {
    let mut objects = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        match record {
            Value::Object(map) => objects.push(map),
            other => {
                return Err(BronzeError::InvalidRecord {
                    index,
                    reason: format!("expected a JSON object, got {}", type_name(other)),
                })
            }
        }
    }

    let mut names: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();
    for map in &objects {
        for name in map.keys() {
            if seen.insert(name.as_str()) {
                names.push(name.as_str());
            }
        }
    }

    let columns = names
        .iter()
        .map(|name| build_column(name, &objects))
        .collect::<Vec<_>>();
    DataFrame::new(columns).map_err(|e| BronzeError::polars("assemble record frame", e))
}

fn build_column(name: &str, objects: &[&Map<String, Value>]) -> Column {
    let values: Vec<Option<&Value>> = objects.iter().map(|m| m.get(name)).collect();
    match infer(&values) {
        Inferred::Boolean => {
            let v: Vec<Option<bool>> = values.iter().map(|v| v.and_then(Value::as_bool)).collect();
            Column::new(name.into(), v)
        }
        Inferred::Int64 => {
            let v: Vec<Option<i64>> = values.iter().map(|v| v.and_then(Value::as_i64)).collect();
            Column::new(name.into(), v)
        }
        Inferred::Float64 => {
            let v: Vec<Option<f64>> = values.iter().map(|v| v.and_then(Value::as_f64)).collect();
            Column::new(name.into(), v)
        }
        Inferred::String => {
            let v: Vec<Option<String>> = values.iter().map(|v| v.and_then(as_text)).collect();
            Column::new(name.into(), v)
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn any_to_json(v: AnyValue<'_>) -> Value {
    match v {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        AnyValue::Int8(n) => Value::from(n),
        AnyValue::Int16(n) => Value::from(n),
        AnyValue::Int32(n) => Value::from(n),
        AnyValue::Int64(n) => Value::from(n),
        AnyValue::UInt8(n) => Value::from(n),
        AnyValue::UInt16(n) => Value::from(n),
        AnyValue::UInt32(n) => Value::from(n),
        AnyValue::UInt64(n) => Value::from(n),
        AnyValue::Float32(f) => Number::from_f64(f as f64).map_or(Value::Null, Value::Number),
        AnyValue::Float64(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        other => Value::String(other.to_string()),
    }
}

/// Rows of a frame as JSON objects; nulls become JSON null.
pub fn dataframe_to_records(df: &DataFrame) -> Result<Vec<Map<String, Value>>, BronzeError> {
    let mut rows = vec![Map::new(); df.height()];
    for column in df.get_columns() {
        let name = column.name().to_string();
        for (i, row) in rows.iter_mut().enumerate() {
            let value = column
                .get(i)
                .map_err(|e| BronzeError::polars(format!("read '{name}' row {i}"), e))?;
            row.insert(name.clone(), any_to_json(value));
        }
    }
    Ok(rows)
}
