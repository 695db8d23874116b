//! Immutable columnar table and the builder stages use to produce new tables.

use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    Float,
    String,
    Boolean,
    DateTime,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Integer => write!(f, "integer"),
            DataType::Float => write!(f, "float"),
            DataType::String => write!(f, "string"),
            DataType::Boolean => write!(f, "boolean"),
            DataType::DateTime => write!(f, "datetime"),
        }
    }
}

/// A single table cell, used for row-wise access.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    DateTime(DateTime<Utc>),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Stable textual key used for grouping and distinct counting.
    pub fn key(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Integer(v) => v.to_string(),
            Cell::Float(v) => v.to_string(),
            Cell::String(v) => v.clone(),
            Cell::Boolean(v) => v.to_string(),
            Cell::DateTime(v) => v.to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Null => serde_json::Value::Null,
            Cell::Integer(v) => serde_json::Value::from(*v),
            Cell::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Cell::String(v) => serde_json::Value::String(v.clone()),
            Cell::Boolean(v) => serde_json::Value::Bool(*v),
            Cell::DateTime(v) => serde_json::Value::String(v.to_rfc3339()),
        }
    }

    /// Total order over cells of the same variant; nulls sort first.
    pub fn total_cmp(&self, other: &Cell) -> Ordering {
        match (self, other) {
            (Cell::Integer(a), Cell::Integer(b)) => a.cmp(b),
            (Cell::Float(a), Cell::Float(b)) => a.total_cmp(b),
            (Cell::String(a), Cell::String(b)) => a.cmp(b),
            (Cell::Boolean(a), Cell::Boolean(b)) => a.cmp(b),
            (Cell::DateTime(a), Cell::DateTime(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Cell::Null => 0,
            Cell::Integer(_) => 1,
            Cell::Float(_) => 2,
            Cell::String(_) => 3,
            Cell::Boolean(_) => 4,
            Cell::DateTime(_) => 5,
        }
    }
}

/// Typed column storage. Missing values are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Integer(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    String(Vec<Option<String>>),
    Boolean(Vec<Option<bool>>),
    DateTime(Vec<Option<DateTime<Utc>>>),
}

impl ColumnData {
    pub fn empty(dtype: DataType) -> Self {
        match dtype {
            DataType::Integer => ColumnData::Integer(Vec::new()),
            DataType::Float => ColumnData::Float(Vec::new()),
            DataType::String => ColumnData::String(Vec::new()),
            DataType::Boolean => ColumnData::Boolean(Vec::new()),
            DataType::DateTime => ColumnData::DateTime(Vec::new()),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            ColumnData::Integer(_) => DataType::Integer,
            ColumnData::Float(_) => DataType::Float,
            ColumnData::String(_) => DataType::String,
            ColumnData::Boolean(_) => DataType::Boolean,
            ColumnData::DateTime(_) => DataType::DateTime,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Integer(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::String(v) => v.len(),
            ColumnData::Boolean(v) => v.len(),
            ColumnData::DateTime(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self, index: usize) -> bool {
        match self {
            ColumnData::Integer(v) => v.get(index).is_none_or(|c| c.is_none()),
            ColumnData::Float(v) => v.get(index).is_none_or(|c| c.is_none_or(f64::is_nan)),
            ColumnData::String(v) => v.get(index).is_none_or(|c| c.is_none()),
            ColumnData::Boolean(v) => v.get(index).is_none_or(|c| c.is_none()),
            ColumnData::DateTime(v) => v.get(index).is_none_or(|c| c.is_none()),
        }
    }

    pub fn missing_count(&self) -> usize {
        (0..self.len()).filter(|&i| self.is_missing(i)).count()
    }

    pub fn cell(&self, index: usize) -> Cell {
        if self.is_missing(index) {
            return Cell::Null;
        }
        match self {
            ColumnData::Integer(v) => v[index].map_or(Cell::Null, Cell::Integer),
            ColumnData::Float(v) => v[index].map_or(Cell::Null, Cell::Float),
            ColumnData::String(v) => v[index].clone().map_or(Cell::Null, Cell::String),
            ColumnData::Boolean(v) => v[index].map_or(Cell::Null, Cell::Boolean),
            ColumnData::DateTime(v) => v[index].map_or(Cell::Null, Cell::DateTime),
        }
    }

    /// Numeric view of the column; `None` for non-numeric columns.
    /// NaN floats are reported as missing.
    pub fn as_f64(&self) -> Option<Vec<Option<f64>>> {
        match self {
            ColumnData::Integer(v) => Some(v.iter().map(|c| c.map(|x| x as f64)).collect()),
            ColumnData::Float(v) => Some(v.iter().map(|c| c.filter(|x| !x.is_nan())).collect()),
            _ => None,
        }
    }

    /// Non-missing numeric values in row order.
    pub fn present_f64(&self) -> Vec<f64> {
        self.as_f64()
            .map(|v| v.into_iter().flatten().collect())
            .unwrap_or_default()
    }

    /// Number of distinct non-missing values.
    pub fn distinct_count(&self) -> usize {
        match self {
            ColumnData::Integer(v) => v.iter().flatten().collect::<HashSet<_>>().len(),
            ColumnData::Float(v) => v
                .iter()
                .flatten()
                .filter(|x| !x.is_nan())
                .map(|x| if *x == 0.0 { 0u64 } else { x.to_bits() })
                .collect::<HashSet<_>>()
                .len(),
            ColumnData::String(v) => v.iter().flatten().collect::<HashSet<_>>().len(),
            ColumnData::Boolean(v) => v.iter().flatten().collect::<HashSet<_>>().len(),
            ColumnData::DateTime(v) => v.iter().flatten().collect::<HashSet<_>>().len(),
        }
    }

    /// Append a cell, coercing compatible numeric kinds. Floats pushed into
    /// an integer column are rounded.
    pub fn push_cell(&mut self, cell: &Cell) -> Result<(), PipelineError> {
        match (self, cell) {
            (ColumnData::Integer(v), Cell::Null) => v.push(None),
            (ColumnData::Integer(v), Cell::Integer(x)) => v.push(Some(*x)),
            (ColumnData::Integer(v), Cell::Float(x)) => {
                v.push(x.is_finite().then(|| x.round() as i64));
            }
            (ColumnData::Float(v), Cell::Null) => v.push(None),
            (ColumnData::Float(v), Cell::Float(x)) => v.push(Some(*x)),
            (ColumnData::Float(v), Cell::Integer(x)) => v.push(Some(*x as f64)),
            (ColumnData::String(v), Cell::Null) => v.push(None),
            (ColumnData::String(v), Cell::String(x)) => v.push(Some(x.clone())),
            (ColumnData::Boolean(v), Cell::Null) => v.push(None),
            (ColumnData::Boolean(v), Cell::Boolean(x)) => v.push(Some(*x)),
            (ColumnData::DateTime(v), Cell::Null) => v.push(None),
            (ColumnData::DateTime(v), Cell::DateTime(x)) => v.push(Some(*x)),
            (data, cell) => {
                return Err(PipelineError::invalid_table(format!(
                    "cannot store {cell:?} in a {} column",
                    data.dtype()
                )));
            }
        }
        Ok(())
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(flatten)]
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn integer(name: impl Into<String>, values: Vec<Option<i64>>) -> Self {
        Self::new(name, ColumnData::Integer(values))
    }

    pub fn float(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self::new(name, ColumnData::Float(values))
    }

    pub fn string<S: Into<String>>(name: impl Into<String>, values: Vec<Option<S>>) -> Self {
        Self::new(
            name,
            ColumnData::String(values.into_iter().map(|v| v.map(Into::into)).collect()),
        )
    }

    pub fn boolean(name: impl Into<String>, values: Vec<Option<bool>>) -> Self {
        Self::new(name, ColumnData::Boolean(values))
    }

    pub fn datetime(name: impl Into<String>, values: Vec<Option<DateTime<Utc>>>) -> Self {
        Self::new(name, ColumnData::DateTime(values))
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An immutable in-memory table with a uniform row count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<Column>,
    row_count: usize,
}

impl Table {
    /// Build a table, checking that names are unique and lengths agree.
    pub fn new(columns: Vec<Column>) -> Result<Self, PipelineError> {
        let row_count = columns.first().map_or(0, Column::len);
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(PipelineError::invalid_table(format!(
                    "duplicate column name '{}'",
                    column.name
                )));
            }
            if column.len() != row_count {
                return Err(PipelineError::invalid_table(format!(
                    "column '{}' has {} rows, expected {row_count}",
                    column.name,
                    column.len()
                )));
            }
        }
        Ok(Self { columns, row_count })
    }

    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            row_count: 0,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn numeric_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.dtype().is_numeric())
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row(&self, index: usize) -> Vec<Cell> {
        self.columns.iter().map(|c| c.data.cell(index)).collect()
    }

    /// Return a new table with `rows` appended; existing rows are untouched.
    /// Each row must have one cell per column, in column order.
    pub fn with_appended_rows(&self, rows: &[Vec<Cell>]) -> Result<Table, PipelineError> {
        let mut columns = self.columns.clone();
        for row in rows {
            if row.len() != columns.len() {
                return Err(PipelineError::invalid_table(format!(
                    "row has {} cells, expected {}",
                    row.len(),
                    columns.len()
                )));
            }
            for (column, cell) in columns.iter_mut().zip(row) {
                column.data.push_cell(cell)?;
            }
        }
        Table::new(columns)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        (0..self.row_count)
            .map(|i| {
                self.columns
                    .iter()
                    .map(|c| (c.name.clone(), c.data.cell(i).to_json()))
                    .collect()
            })
            .collect()
    }
}

/// Accumulates replacement and new columns for a stage; the result is only
/// visible once [`TableBuilder::build`] swaps them in.
#[derive(Debug, Clone)]
pub struct TableBuilder {
    columns: Vec<Column>,
    row_count: usize,
}

impl TableBuilder {
    pub fn from_table(table: &Table) -> Self {
        Self {
            columns: table.columns.clone(),
            row_count: table.row_count,
        }
    }

    /// Replace an existing column with a same-length column of the same name.
    pub fn replace(&mut self, column: Column) -> Result<(), PipelineError> {
        self.check_len(&column)?;
        let slot = self
            .columns
            .iter_mut()
            .find(|c| c.name == column.name)
            .ok_or_else(|| {
                PipelineError::invalid_table(format!("no column named '{}'", column.name))
            })?;
        *slot = column;
        Ok(())
    }

    /// Append a new column.
    pub fn push(&mut self, column: Column) -> Result<(), PipelineError> {
        self.check_len(&column)?;
        if self.columns.iter().any(|c| c.name == column.name) {
            return Err(PipelineError::invalid_table(format!(
                "column '{}' already exists",
                column.name
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn build(self) -> Result<Table, PipelineError> {
        Table::new(self.columns)
    }

    fn check_len(&self, column: &Column) -> Result<(), PipelineError> {
        if !self.columns.is_empty() && column.len() != self.row_count {
            return Err(PipelineError::invalid_table(format!(
                "column '{}' has {} rows, expected {}",
                column.name,
                column.len(),
                self.row_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new(vec![
            Column::integer("age", vec![Some(25), None, Some(35)]),
            Column::string("city", vec![Some("Oslo"), Some("Rome"), None]),
        ])
        .unwrap()
    }

    #[test]
    fn test_table_rejects_ragged_columns() {
        let err = Table::new(vec![
            Column::integer("a", vec![Some(1), Some(2)]),
            Column::integer("b", vec![Some(1)]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_table_rejects_duplicate_names() {
        let err = Table::new(vec![
            Column::integer("a", vec![Some(1)]),
            Column::float("a", vec![Some(1.0)]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_row_access_and_missing() {
        let table = sample();
        assert_eq!(table.row_count(), 3);
        assert_eq!(
            table.row(0),
            vec![Cell::Integer(25), Cell::String("Oslo".into())]
        );
        assert_eq!(table.column("age").unwrap().data.missing_count(), 1);
        assert!(table.row(2)[1].is_null());
    }

    #[test]
    fn test_append_rows_keeps_existing_rows() {
        let table = sample();
        let extended = table
            .with_appended_rows(&[vec![Cell::Float(40.4), Cell::Null]])
            .unwrap();
        assert_eq!(extended.row_count(), 4);
        assert_eq!(extended.row(0), table.row(0));
        assert_eq!(extended.row(3)[0], Cell::Integer(40));
        assert_eq!(table.row_count(), 3);
    }

    #[test]
    fn test_builder_swaps_columns_at_build() {
        let table = sample();
        let mut builder = TableBuilder::from_table(&table);
        builder
            .replace(Column::float("age", vec![Some(1.0), Some(2.0), Some(3.0)]))
            .unwrap();
        builder
            .push(Column::boolean("flag", vec![Some(true), None, Some(false)]))
            .unwrap();
        assert!(builder.push(Column::boolean("x", vec![None])).is_err());
        let built = builder.build().unwrap();
        assert_eq!(built.column("age").unwrap().dtype(), DataType::Float);
        assert_eq!(built.column_count(), 3);
        assert_eq!(table.column("age").unwrap().dtype(), DataType::Integer);
    }

    #[test]
    fn test_distinct_count_ignores_missing() {
        let data = ColumnData::Float(vec![Some(1.0), Some(1.0), None, Some(f64::NAN), Some(2.0)]);
        assert_eq!(data.distinct_count(), 2);
        assert_eq!(data.missing_count(), 2);
    }

    #[test]
    fn test_records_use_column_names() {
        let records = sample().to_records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["age"], serde_json::json!(25));
        assert_eq!(records[1]["age"], serde_json::Value::Null);
    }
}
