//! Schema validation of tables against a declarative rule set.
//!
//! Findings are returned as a [`ValidationReport`]; only malformed rules are
//! errors.

use crate::data::table::{Column, DataType, Table};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Share of distinct values above which a string column is flagged.
const HIGH_CARDINALITY_RATIO: f64 = 0.9;

fn default_max_missing_ratio() -> f64 {
    0.5
}

/// Inclusive bounds for a numeric column. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }

    fn describe(&self) -> String {
        let fmt = |bound: Option<f64>| bound.map_or_else(|| "-".to_string(), |b| b.to_string());
        format!("[{}, {}]", fmt(self.min), fmt(self.max))
    }
}

/// Declarative validation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub required_columns: BTreeSet<String>,
    /// Column name to expected type name (`integer`, `float`, `numeric`, ...).
    #[serde(default)]
    pub column_types: BTreeMap<String, String>,
    #[serde(default)]
    pub value_ranges: BTreeMap<String, ValueRange>,
    #[serde(default)]
    pub unique_columns: BTreeSet<String>,
    #[serde(default = "default_max_missing_ratio")]
    pub max_missing_ratio: f64,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            required_columns: BTreeSet::new(),
            column_types: BTreeMap::new(),
            value_ranges: BTreeMap::new(),
            unique_columns: BTreeSet::new(),
            max_missing_ratio: default_max_missing_ratio(),
        }
    }
}

impl ValidationRules {
    /// Check the rules themselves, before any table is seen.
    pub fn check(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.max_missing_ratio) {
            return Err(PipelineError::config(format!(
                "max_missing_ratio must be within [0, 1], got {}",
                self.max_missing_ratio
            )));
        }
        for (column, type_name) in &self.column_types {
            ExpectedType::parse(type_name).ok_or_else(|| {
                PipelineError::config(format!(
                    "Unknown type '{type_name}' declared for column '{column}'"
                ))
            })?;
        }
        for (column, range) in &self.value_ranges {
            if let (Some(min), Some(max)) = (range.min, range.max) {
                if min > max {
                    return Err(PipelineError::config(format!(
                        "Range for column '{column}' has min {min} greater than max {max}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Expected logical type, after resolving aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpectedType {
    Exact(DataType),
    Numeric,
}

impl ExpectedType {
    fn parse(name: &str) -> Option<Self> {
        let expected = match name.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" | "int64" | "int32" | "int16" | "int8" | "long" => {
                Self::Exact(DataType::Integer)
            }
            "float" | "double" | "float64" | "float32" | "real" => Self::Exact(DataType::Float),
            "numeric" | "number" => Self::Numeric,
            "string" | "str" | "text" | "object" | "categorical" => Self::Exact(DataType::String),
            "bool" | "boolean" => Self::Exact(DataType::Boolean),
            "datetime" | "timestamp" | "date" | "datetime64" => Self::Exact(DataType::DateTime),
            _ => return None,
        };
        Some(expected)
    }

    fn accepts(self, actual: DataType) -> bool {
        match self {
            Self::Exact(dtype) => dtype == actual,
            Self::Numeric => actual.is_numeric(),
        }
    }
}

/// Outcome of validating one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub violations: Vec<String>,
}

impl ValidationReport {
    fn from_violations(violations: Vec<String>) -> Self {
        Self {
            is_valid: violations.is_empty(),
            violations,
        }
    }
}

/// Validate `table` against `rules`.
pub fn validate(table: &Table, rules: &ValidationRules) -> Result<ValidationReport, PipelineError> {
    rules.check()?;

    let mut violations = Vec::new();
    violations.extend(check_required(table, rules));
    violations.extend(check_types(table, rules));
    violations.extend(check_ranges(table, rules));
    violations.extend(check_unique(table, rules));
    violations.extend(check_missing(table, rules));
    violations.extend(check_quality(table));

    tracing::debug!(
        rows = table.row_count(),
        columns = table.column_count(),
        violations = violations.len(),
        "Validated table"
    );
    Ok(ValidationReport::from_violations(violations))
}

fn check_required(table: &Table, rules: &ValidationRules) -> Vec<String> {
    let missing: Vec<&str> = rules
        .required_columns
        .iter()
        .filter(|name| !table.has_column(name))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Vec::new()
    } else {
        vec![format!("Missing required columns: {}", missing.join(", "))]
    }
}

fn check_types(table: &Table, rules: &ValidationRules) -> Vec<String> {
    rules
        .column_types
        .iter()
        .filter_map(|(name, type_name)| {
            let column = table.column(name)?;
            let expected = ExpectedType::parse(type_name)?;
            (!expected.accepts(column.dtype())).then(|| {
                format!(
                    "Column {name} has type {}, expected {type_name}",
                    column.dtype()
                )
            })
        })
        .collect()
}

fn check_ranges(table: &Table, rules: &ValidationRules) -> Vec<String> {
    let mut violations = Vec::new();
    for (name, range) in &rules.value_ranges {
        let Some(column) = table.column(name) else {
            continue;
        };
        let Some(values) = column.data.as_f64() else {
            violations.push(format!(
                "Column {name} has type {}, range {} requires a numeric column",
                column.dtype(),
                range.describe()
            ));
            continue;
        };
        let outside = values
            .iter()
            .flatten()
            .filter(|v| !range.contains(**v))
            .count();
        if outside > 0 {
            violations.push(format!(
                "Column {name} has {outside} values outside range {}",
                range.describe()
            ));
        }
    }
    violations
}

fn check_unique(table: &Table, rules: &ValidationRules) -> Vec<String> {
    rules
        .unique_columns
        .iter()
        .filter_map(|name| {
            let column = table.column(name)?;
            let duplicates = duplicate_count(column);
            (duplicates > 0).then(|| format!("Column {name} has {duplicates} duplicate values"))
        })
        .collect()
}

fn duplicate_count(column: &Column) -> usize {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for i in 0..column.len() {
        let cell = column.data.cell(i);
        if !cell.is_null() {
            *seen.entry(cell.key()).or_default() += 1;
        }
    }
    seen.values().map(|count| count - 1).sum()
}

fn check_missing(table: &Table, rules: &ValidationRules) -> Vec<String> {
    let rows = table.row_count();
    if rows == 0 {
        return Vec::new();
    }
    table
        .columns()
        .iter()
        .filter_map(|column| {
            let ratio = column.data.missing_count() as f64 / rows as f64;
            (ratio > rules.max_missing_ratio).then(|| {
                format!(
                    "Column {} has {:.2}% missing values, exceeding threshold of {:.2}%",
                    column.name,
                    ratio * 100.0,
                    rules.max_missing_ratio * 100.0
                )
            })
        })
        .collect()
}

fn check_quality(table: &Table) -> Vec<String> {
    let mut violations = Vec::new();

    let constant: Vec<&str> = table
        .columns()
        .iter()
        .filter(|c| c.data.distinct_count() == 1)
        .map(|c| c.name.as_str())
        .collect();
    if !constant.is_empty() {
        violations.push(format!("Constant columns detected: {}", constant.join(", ")));
    }

    let rows = table.row_count();
    if rows > 0 {
        for column in table.columns().iter().filter(|c| c.dtype() == DataType::String) {
            let ratio = column.data.distinct_count() as f64 / rows as f64;
            if ratio > HIGH_CARDINALITY_RATIO {
                violations.push(format!(
                    "High cardinality detected in column {}: {:.2}% unique values",
                    column.name,
                    ratio * 100.0
                ));
            }
        }
    }
    violations
}
