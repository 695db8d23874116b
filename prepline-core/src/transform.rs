//! Column transform engine: imputation, outlier replacement, interaction
//! features, scaling and categorical encoding.
//!
//! Steps run in a fixed order: missing → outliers → features → scaling →
//! encoding. Per-column work is fanned out over a bounded rayon pool. A failing
//! column is passed through with an error marker; it never aborts the table.

use crate::data::table::{Cell, Column, ColumnData, DataType, Table, TableBuilder};
use crate::error::PipelineError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;

const STAGE: &str = "preprocessing";

/// Standard deviations below this are treated as zero.
const MIN_STD: f64 = 1e-12;

/// How missing numeric values are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingStrategy {
    #[default]
    Mean,
    Median,
    Mode,
    Zero,
}

/// Outlier detection method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    #[default]
    Zscore,
}

fn default_true() -> bool {
    true
}

fn default_outlier_threshold() -> f64 {
    3.0
}

/// Preprocessing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    #[serde(default = "default_true")]
    pub handle_missing: bool,
    #[serde(default)]
    pub missing_strategy: MissingStrategy,
    #[serde(default = "default_true")]
    pub handle_outliers: bool,
    #[serde(default)]
    pub outlier_method: OutlierMethod,
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,
    #[serde(default = "default_true")]
    pub scaling: bool,
    #[serde(default)]
    pub feature_engineering: bool,
    /// Column pairs multiplied into `{a}_{b}_interaction` columns.
    #[serde(default)]
    pub interactions: Vec<(String, String)>,
    #[serde(default)]
    pub encode_categorical: bool,
    /// Worker threads for per-column work; 0 uses all cores.
    #[serde(default)]
    pub max_workers: usize,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            handle_missing: true,
            missing_strategy: MissingStrategy::default(),
            handle_outliers: true,
            outlier_method: OutlierMethod::default(),
            outlier_threshold: default_outlier_threshold(),
            scaling: true,
            feature_engineering: false,
            interactions: Vec::new(),
            encode_categorical: false,
            max_workers: 0,
        }
    }
}

impl PreprocessingConfig {
    pub fn check(&self) -> Result<(), PipelineError> {
        if !self.outlier_threshold.is_finite() || self.outlier_threshold <= 0.0 {
            return Err(PipelineError::config(format!(
                "outlier_threshold must be a positive number, got {}",
                self.outlier_threshold
            )));
        }
        Ok(())
    }
}

/// Per-column record kept for reporting and inverse transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub name: String,
    pub dtype: DataType,
    /// Pre-scaling mean of the cleaned column.
    pub mean: Option<f64>,
    /// Pre-scaling population standard deviation of the cleaned column.
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Missing values in the input column.
    pub missing_count: usize,
    #[serde(default)]
    pub imputed_value: Option<serde_json::Value>,
    #[serde(default)]
    pub outliers_replaced: usize,
    #[serde(default)]
    pub scaled: bool,
    /// Category labels in code order, for encoded columns.
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ColumnStatistics {
    fn for_column(column: &Column) -> Self {
        let mut stats = Self {
            name: column.name.clone(),
            dtype: column.dtype(),
            mean: None,
            std: None,
            min: None,
            max: None,
            missing_count: column.data.missing_count(),
            imputed_value: None,
            outliers_replaced: 0,
            scaled: false,
            categories: None,
            error: None,
        };
        stats.describe(&column.data);
        stats
    }

    fn describe(&mut self, data: &ColumnData) {
        self.dtype = data.dtype();
        let values = data.present_f64();
        if values.is_empty() {
            return;
        }
        let (mean, std) = mean_and_population_std(&values);
        self.mean = Some(mean);
        self.std = Some(std);
        self.min = values.iter().copied().reduce(f64::min);
        self.max = values.iter().copied().reduce(f64::max);
    }
}

/// Result of a transform pass.
#[derive(Debug, Clone, Serialize)]
pub struct TransformOutput {
    #[serde(skip)]
    pub table: Table,
    pub statistics: BTreeMap<String, ColumnStatistics>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// One column moving through the per-column steps.
struct ColumnWork {
    column: Column,
    stats: ColumnStatistics,
    errors: Vec<String>,
}

impl ColumnWork {
    fn fail(&mut self, message: String) {
        tracing::debug!(column = %self.column.name, %message, "Column step failed");
        self.stats.error = Some(match self.stats.error.take() {
            Some(previous) => format!("{previous}; {message}"),
            None => message.clone(),
        });
        self.errors.push(format!("Column '{}': {message}", self.column.name));
    }
}

/// Applies the configured column transforms to a table.
pub struct ColumnTransformer {
    config: PreprocessingConfig,
    cancel: CancellationToken,
}

impl ColumnTransformer {
    pub fn new(config: PreprocessingConfig) -> Result<Self, PipelineError> {
        config.check()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Use `token` to stop work between columns.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PreprocessingConfig {
        &self.config
    }

    pub fn transform(&self, table: &Table) -> Result<TransformOutput, PipelineError> {
        tracing::info!(
            rows = table.row_count(),
            columns = table.column_count(),
            workers = self.config.max_workers,
            "Starting column transforms"
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers)
            .build()
            .map_err(|e| PipelineError::stage(STAGE, format!("worker pool: {e}")))?;

        let work: Vec<ColumnWork> = table
            .columns()
            .iter()
            .map(|column| ColumnWork {
                stats: ColumnStatistics::for_column(column),
                column: column.clone(),
                errors: Vec::new(),
            })
            .collect();

        let mut work = pool.install(|| self.run_parallel(work, |w| self.clean(w)))?;

        let mut warnings = Vec::new();
        if self.config.feature_engineering {
            self.add_interactions(&mut work, &mut warnings)?;
        }

        let work = pool.install(|| self.run_parallel(work, |w| self.finish(w)))?;

        let mut builder = TableBuilder::from_table(table);
        let mut statistics = BTreeMap::new();
        let mut errors = Vec::new();
        for item in work {
            if table.has_column(&item.column.name) {
                builder.replace(item.column)?;
            } else {
                builder.push(item.column)?;
            }
            errors.extend(item.errors);
            statistics.insert(item.stats.name.clone(), item.stats);
        }
        let table = builder.build()?;

        tracing::info!(
            columns = table.column_count(),
            errors = errors.len(),
            warnings = warnings.len(),
            "Column transforms finished"
        );
        Ok(TransformOutput {
            table,
            statistics,
            errors,
            warnings,
        })
    }

    fn run_parallel<F>(&self, work: Vec<ColumnWork>, step: F) -> Result<Vec<ColumnWork>, PipelineError>
    where
        F: Fn(ColumnWork) -> ColumnWork + Sync + Send,
    {
        work.into_par_iter()
            .map(|item| {
                if self.cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                Ok(step(item))
            })
            .collect()
    }

    /// Missing values, then outliers.
    fn clean(&self, mut work: ColumnWork) -> ColumnWork {
        if self.config.handle_missing && work.stats.missing_count > 0 {
            impute(&mut work, self.config.missing_strategy);
        }
        if self.config.handle_outliers && work.column.dtype().is_numeric() {
            match self.config.outlier_method {
                OutlierMethod::Zscore => replace_zscore_outliers(&mut work, self.config.outlier_threshold),
            }
        }
        work.stats.describe(&work.column.data);
        work
    }

    /// Scaling, then encoding.
    fn finish(&self, mut work: ColumnWork) -> ColumnWork {
        if self.config.scaling && work.column.dtype().is_numeric() {
            standardize(&mut work);
        }
        if self.config.encode_categorical && work.column.dtype() == DataType::String {
            encode(&mut work);
        }
        work
    }

    fn add_interactions(
        &self,
        work: &mut Vec<ColumnWork>,
        warnings: &mut Vec<String>,
    ) -> Result<(), PipelineError> {
        for (a, b) in &self.config.interactions {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let lookup = |name: &str| {
                work.iter()
                    .find(|w| w.column.name == name)
                    .and_then(|w| w.column.data.as_f64())
            };
            let (Some(left), Some(right)) = (lookup(a), lookup(b)) else {
                let message =
                    format!("Interaction {a} x {b} skipped: both columns must exist and be numeric");
                tracing::warn!(%message);
                warnings.push(message);
                continue;
            };
            let name = format!("{a}_{b}_interaction");
            if work.iter().any(|w| w.column.name == name) {
                let message = format!("Interaction column {name} already exists; skipped");
                tracing::warn!(%message);
                warnings.push(message);
                continue;
            }
            let values = left
                .iter()
                .zip(&right)
                .map(|(l, r)| Some((*l)? * (*r)?))
                .collect();
            let column = Column::float(name, values);
            tracing::debug!(column = %column.name, "Added interaction column");
            work.push(ColumnWork {
                stats: ColumnStatistics::for_column(&column),
                column,
                errors: Vec::new(),
            });
        }
        Ok(())
    }
}

fn impute(work: &mut ColumnWork, strategy: MissingStrategy) {
    match work.column.data.as_f64() {
        Some(values) => impute_numeric(work, values, strategy),
        None => impute_mode(work),
    }
}

fn impute_numeric(work: &mut ColumnWork, values: Vec<Option<f64>>, strategy: MissingStrategy) {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        work.fail("no non-missing values to impute from".to_string());
        return;
    }
    let fill = match strategy {
        MissingStrategy::Mean => present.iter().sum::<f64>() / present.len() as f64,
        MissingStrategy::Median => median(&present),
        MissingStrategy::Mode => numeric_mode(&present),
        MissingStrategy::Zero => 0.0,
    };
    let filled = values.into_iter().map(|v| Some(v.unwrap_or(fill))).collect();
    work.column.data = ColumnData::Float(filled);
    work.stats.imputed_value = serde_json::Number::from_f64(fill).map(serde_json::Value::Number);
}

/// Fill non-numeric columns with the most frequent value; ties go to the
/// smallest value.
fn impute_mode(work: &mut ColumnWork) {
    let data = &work.column.data;
    let mut present: Vec<Cell> = (0..data.len())
        .map(|i| data.cell(i))
        .filter(|c| !c.is_null())
        .collect();
    if present.is_empty() {
        work.fail("no non-missing values to impute from".to_string());
        return;
    }
    present.sort_by(Cell::total_cmp);
    let mut best = (present[0].clone(), 0usize);
    let mut run = (present[0].clone(), 0usize);
    for cell in present {
        if cell == run.0 {
            run.1 += 1;
        } else {
            run = (cell, 1);
        }
        if run.1 > best.1 {
            best = run.clone();
        }
    }
    let fill = best.0;

    let mut filled = ColumnData::empty(data.dtype());
    for i in 0..data.len() {
        let cell = data.cell(i);
        let cell = if cell.is_null() { fill.clone() } else { cell };
        if let Err(e) = filled.push_cell(&cell) {
            work.fail(e.to_string());
            return;
        }
    }
    work.column.data = filled;
    work.stats.imputed_value = Some(fill.to_json());
}

/// Replace values whose leave-one-out z-score exceeds `threshold` with the
/// column median.
fn replace_zscore_outliers(work: &mut ColumnWork, threshold: f64) {
    let Some(values) = work.column.data.as_f64() else {
        return;
    };
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    let n = present.len();
    if n < 3 {
        return;
    }
    let nf = n as f64;
    let mean = present.iter().sum::<f64>() / nf;
    let ss: f64 = present.iter().map(|x| (x - mean).powi(2)).sum();
    let replacement = median(&present);

    let mut replaced = 0;
    let cleaned: Vec<Option<f64>> = values
        .into_iter()
        .map(|v| {
            let x = v?;
            // Mean and sample variance of the other n-1 values.
            let loo_mean = (nf * mean - x) / (nf - 1.0);
            let loo_ss = (ss - (x - mean).powi(2) * nf / (nf - 1.0)).max(0.0);
            let loo_std = (loo_ss / (nf - 2.0)).sqrt();
            if loo_std <= MIN_STD * loo_mean.abs().max(1.0) {
                return Some(x);
            }
            if (x - loo_mean).abs() / loo_std > threshold {
                replaced += 1;
                Some(replacement)
            } else {
                Some(x)
            }
        })
        .collect();

    if replaced > 0 {
        tracing::debug!(column = %work.column.name, replaced, "Replaced outliers");
        work.column.data = rebuild_numeric(work.column.dtype(), cleaned);
        work.stats.outliers_replaced = replaced;
    }
}

fn standardize(work: &mut ColumnWork) {
    let Some(values) = work.column.data.as_f64() else {
        return;
    };
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        work.fail("no values to scale".to_string());
        return;
    }
    let (mean, std) = mean_and_population_std(&present);
    if std <= MIN_STD * mean.abs().max(1.0) {
        work.fail("zero variance; left unscaled".to_string());
        return;
    }
    let scaled: Vec<Option<f64>> = values.iter().map(|v| v.map(|x| (x - mean) / std)).collect();
    let present_scaled: Vec<f64> = scaled.iter().flatten().copied().collect();
    work.stats.mean = Some(mean);
    work.stats.std = Some(std);
    work.stats.min = present_scaled.iter().copied().reduce(f64::min);
    work.stats.max = present_scaled.iter().copied().reduce(f64::max);
    work.stats.scaled = true;
    work.stats.dtype = DataType::Float;
    work.column.data = ColumnData::Float(scaled);
}

/// Map each distinct string to an integer code in first-seen order.
fn encode(work: &mut ColumnWork) {
    let ColumnData::String(values) = &work.column.data else {
        return;
    };
    let mut codes: HashMap<&str, i64> = HashMap::new();
    let mut categories: Vec<String> = Vec::new();
    let encoded: Vec<Option<i64>> = values
        .iter()
        .map(|v| {
            let v = v.as_deref()?;
            Some(*codes.entry(v).or_insert_with(|| {
                categories.push(v.to_string());
                categories.len() as i64 - 1
            }))
        })
        .collect();
    work.stats.categories = Some(categories);
    work.stats.dtype = DataType::Integer;
    work.column.data = ColumnData::Integer(encoded);
}

fn rebuild_numeric(dtype: DataType, values: Vec<Option<f64>>) -> ColumnData {
    match dtype {
        DataType::Integer => ColumnData::Integer(
            values
                .into_iter()
                .map(|v| v.filter(|x| x.is_finite()).map(|x| x.round() as i64))
                .collect(),
        ),
        _ => ColumnData::Float(values),
    }
}

pub(crate) fn mean_and_population_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

pub(crate) fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn numeric_mode(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut best = (sorted[0], 0usize);
    let mut run = (sorted[0], 0usize);
    for x in sorted {
        if x == run.0 {
            run.1 += 1;
        } else {
            run = (x, 1);
        }
        if run.1 > best.1 {
            best = run;
        }
    }
    best.0
}
