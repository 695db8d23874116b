//! Type inference for loaded datasets.

use crate::data::table::{Column, ColumnData, DataType, Table};
use crate::error::PipelineError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Infer the logical column type from a sample of JSON values.
///
/// Returns `None` when every value is null; callers treat such columns as
/// strings.
pub fn infer_column_type(values: &[Value]) -> Option<DataType> {
    let non_null: Vec<_> = values.iter().filter(|v| !v.is_null()).collect();
    if non_null.is_empty() {
        return None;
    }

    let mut has_int = false;
    let mut has_float = false;
    let mut has_bool = false;
    let mut has_string = false;
    let mut all_strings_are_dates = true;

    for v in &non_null {
        match v {
            Value::Number(n) => {
                // u64 beyond i64::MAX has no integer cell
                if n.is_f64() || n.as_i64().is_none() {
                    has_float = true;
                } else {
                    has_int = true;
                }
            }
            Value::Bool(_) => has_bool = true,
            Value::String(s) => {
                has_string = true;
                if parse_datetime(s).is_none() {
                    all_strings_are_dates = false;
                }
            }
            _ => {
                has_string = true;
                all_strings_are_dates = false;
            }
        }
    }

    if has_string {
        if all_strings_are_dates && !has_int && !has_float && !has_bool {
            return Some(DataType::DateTime);
        }
        return Some(DataType::String);
    }
    if has_bool && (has_int || has_float) {
        return Some(DataType::String);
    }
    if has_float {
        return Some(DataType::Float);
    }
    if has_int {
        return Some(DataType::Integer);
    }
    Some(DataType::Boolean)
}

/// Parse an unquoted text field (CSV) into a typed JSON scalar.
///
/// Quoted fields never reach this; the loader keeps them as strings.
pub fn parse_field(raw: &str) -> Value {
    let s = raw.trim();
    if s.is_empty() || matches!(s, "NA" | "N/A" | "NaN" | "nan" | "null" | "NULL" | "None") {
        return Value::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = s.parse::<f64>() {
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    match s {
        "true" | "True" | "TRUE" => Value::Bool(true),
        "false" | "False" | "FALSE" => Value::Bool(false),
        _ => Value::String(s.to_string()),
    }
}

/// Parse RFC 3339 timestamps, `YYYY-MM-DD HH:MM:SS`, and plain dates.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Build a typed column from JSON values using the inferred type.
pub fn build_column(name: &str, values: &[Value]) -> Column {
    let dtype = infer_column_type(values).unwrap_or(DataType::String);
    let data = match dtype {
        DataType::Integer => ColumnData::Integer(values.iter().map(Value::as_i64).collect()),
        DataType::Float => ColumnData::Float(values.iter().map(Value::as_f64).collect()),
        DataType::Boolean => ColumnData::Boolean(values.iter().map(Value::as_bool).collect()),
        DataType::DateTime => ColumnData::DateTime(
            values
                .iter()
                .map(|v| v.as_str().and_then(parse_datetime))
                .collect(),
        ),
        DataType::String => ColumnData::String(
            values
                .iter()
                .map(|v| match v {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .collect(),
        ),
    };
    Column::new(name, data)
}

/// Build a table from a header and row-major JSON values.
pub fn table_from_rows(columns: &[String], rows: &[Vec<Value>]) -> Result<Table, PipelineError> {
    let built = columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let values: Vec<Value> = rows
                .iter()
                .map(|row| row.get(i).cloned().unwrap_or(Value::Null))
                .collect();
            build_column(name, &values)
        })
        .collect();
    Table::new(built)
}
