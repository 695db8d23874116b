//! Analysis engine: summary statistics, missing counts, correlations,
//! distribution shape and a 2-D principal component projection.

use crate::data::table::{DataType, Table};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Histogram bin count used for distribution summaries.
const HISTOGRAM_BINS: usize = 30;

fn default_true() -> bool {
    true
}

/// Which sections the analysis report contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_true")]
    pub summary_statistics: bool,
    #[serde(default = "default_true")]
    pub missing_values: bool,
    #[serde(default = "default_true", alias = "perform_correlation")]
    pub correlations: bool,
    #[serde(default = "default_true")]
    pub distributions: bool,
    #[serde(default = "default_true")]
    pub projection: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            summary_statistics: true,
            missing_values: true,
            correlations: true,
            distributions: true,
            projection: true,
        }
    }
}

/// Per numeric column summary. Quantiles are linearly interpolated and the
/// standard deviation is the sample one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub q25: Option<f64>,
    pub median: Option<f64>,
    pub q75: Option<f64>,
    pub max: Option<f64>,
}

/// Pearson coefficients over pairwise-complete rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub columns: Vec<String>,
    /// `matrix[i][j]` is `None` when the coefficient is undefined.
    pub matrix: Vec<Vec<Option<f64>>>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.columns.iter().position(|c| c == a)?;
        let j = self.columns.iter().position(|c| c == b)?;
        self.matrix[i][j]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
}

/// Distribution shape of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionStats {
    pub unique_count: usize,
    /// Bias-corrected sample skewness (G1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skewness: Option<f64>,
    /// Bias-corrected excess kurtosis (G2).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kurtosis: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Histogram>,
}

/// First two principal components of the standardized numeric features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub columns: Vec<String>,
    /// Indices of the complete rows that were projected.
    pub row_indices: Vec<usize>,
    pub components: Vec<[f64; 2]>,
    pub explained_variance_ratio: [f64; 2],
    pub loadings: BTreeMap<String, [f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub row_count: usize,
    pub column_count: usize,
    pub column_types: BTreeMap<String, DataType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BTreeMap<String, SummaryStatistics>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_values: Option<BTreeMap<String, usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlations: Option<CorrelationMatrix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributions: Option<BTreeMap<String, DistributionStats>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Projection>,
}

/// Produces an [`AnalysisReport`] for a table.
pub struct Analyzer {
    config: AnalysisConfig,
    cancel: CancellationToken,
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn analyze(&self, table: &Table) -> Result<AnalysisReport, PipelineError> {
        let numeric: Vec<(String, Vec<Option<f64>>)> = table
            .numeric_columns()
            .filter_map(|c| Some((c.name.clone(), c.data.as_f64()?)))
            .collect();

        let mut report = AnalysisReport {
            row_count: table.row_count(),
            column_count: table.column_count(),
            column_types: table
                .columns()
                .iter()
                .map(|c| (c.name.clone(), c.dtype()))
                .collect(),
            summary: None,
            missing_values: None,
            correlations: None,
            distributions: None,
            projection: None,
        };

        if self.config.summary_statistics {
            self.checkpoint()?;
            report.summary = Some(
                numeric
                    .iter()
                    .map(|(name, values)| (name.clone(), summarize(values)))
                    .collect(),
            );
        }

        if self.config.missing_values {
            report.missing_values = Some(
                table
                    .columns()
                    .iter()
                    .map(|c| (c.name.clone(), c.data.missing_count()))
                    .collect(),
            );
        }

        if self.config.correlations && numeric.len() >= 2 {
            self.checkpoint()?;
            report.correlations = Some(correlation_matrix(&numeric));
        }

        if self.config.distributions {
            self.checkpoint()?;
            let mut distributions = BTreeMap::new();
            for column in table.columns() {
                let mut stats = DistributionStats {
                    unique_count: column.data.distinct_count(),
                    skewness: None,
                    kurtosis: None,
                    histogram: None,
                };
                if column.dtype().is_numeric() {
                    let values = column.data.present_f64();
                    stats.skewness = skewness(&values);
                    stats.kurtosis = excess_kurtosis(&values);
                    stats.histogram = histogram(&values, HISTOGRAM_BINS);
                }
                distributions.insert(column.name.clone(), stats);
            }
            report.distributions = Some(distributions);
        }

        if self.config.projection && numeric.len() >= 3 {
            self.checkpoint()?;
            report.projection = project(&numeric);
        }

        tracing::debug!(
            rows = report.row_count,
            numeric_columns = numeric.len(),
            correlations = report.correlations.is_some(),
            projection = report.projection.is_some(),
            "Analysis complete"
        );
        Ok(report)
    }

    fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn summarize(values: &[Option<f64>]) -> SummaryStatistics {
    let mut present: Vec<f64> = values.iter().flatten().copied().collect();
    present.sort_by(f64::total_cmp);
    let count = present.len();
    if count == 0 {
        return SummaryStatistics {
            count,
            mean: None,
            std: None,
            min: None,
            q25: None,
            median: None,
            q75: None,
            max: None,
        };
    }
    let mean = present.iter().sum::<f64>() / count as f64;
    SummaryStatistics {
        count,
        mean: Some(mean),
        std: sample_std(&present, mean),
        min: present.first().copied(),
        q25: Some(quantile(&present, 0.25)),
        median: Some(quantile(&present, 0.5)),
        q75: Some(quantile(&present, 0.75)),
        max: present.last().copied(),
    }
}

fn sample_std(values: &[f64], mean: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let ss: f64 = values.iter().map(|x| (x - mean).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Linear interpolation between closest ranks; `sorted` must be ascending.
pub(crate) fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn correlation_matrix(numeric: &[(String, Vec<Option<f64>>)]) -> CorrelationMatrix {
    let k = numeric.len();
    let mut matrix = vec![vec![None; k]; k];
    for i in 0..k {
        for j in i..k {
            let r = pearson(&numeric[i].1, &numeric[j].1);
            matrix[i][j] = r;
            matrix[j][i] = r;
        }
    }
    CorrelationMatrix {
        columns: numeric.iter().map(|(name, _)| name.clone()).collect(),
        matrix,
    }
}

fn pearson(a: &[Option<f64>], b: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some((cov / (var_a * var_b).sqrt()).clamp(-1.0, 1.0))
}

fn central_moments(values: &[f64]) -> (f64, f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
    for x in values {
        let d = x - mean;
        m2 += d * d;
        m3 += d * d * d;
        m4 += d * d * d * d;
    }
    (m2 / n, m3 / n, m4 / n)
}

fn skewness(values: &[f64]) -> Option<f64> {
    let n = values.len() as f64;
    if values.len() < 3 {
        return None;
    }
    let (m2, m3, _) = central_moments(values);
    if m2 <= 0.0 {
        return None;
    }
    let g1 = m3 / m2.powf(1.5);
    Some(g1 * (n * (n - 1.0)).sqrt() / (n - 2.0))
}

fn excess_kurtosis(values: &[f64]) -> Option<f64> {
    let n = values.len() as f64;
    if values.len() < 4 {
        return None;
    }
    let (m2, _, m4) = central_moments(values);
    if m2 <= 0.0 {
        return None;
    }
    let g2 = m4 / (m2 * m2) - 3.0;
    Some(((n + 1.0) * g2 + 6.0) * (n - 1.0) / ((n - 2.0) * (n - 3.0)))
}

fn histogram(values: &[f64], max_bins: usize) -> Option<Histogram> {
    let min = values.iter().copied().reduce(f64::min)?;
    let max = values.iter().copied().reduce(f64::max)?;
    let bins = max_bins.min(values.len()).max(1);
    let width = (max - min) / bins as f64;
    let edges = (0..=bins).map(|i| min + width * i as f64).collect();
    let mut counts = vec![0; bins];
    for x in values {
        let idx = if width > 0.0 {
            (((x - min) / width) as usize).min(bins - 1)
        } else {
            0
        };
        counts[idx] += 1;
    }
    Some(Histogram { edges, counts })
}

fn project(numeric: &[(String, Vec<Option<f64>>)]) -> Option<Projection> {
    let rows = numeric.first()?.1.len();
    let row_indices: Vec<usize> = (0..rows)
        .filter(|&i| numeric.iter().all(|(_, values)| values[i].is_some()))
        .collect();
    if row_indices.len() < 3 {
        return None;
    }

    // Standardize each feature over the complete rows.
    let p = numeric.len();
    let n = row_indices.len();
    let mut data = vec![vec![0.0; p]; n];
    for (j, (_, values)) in numeric.iter().enumerate() {
        let column: Vec<f64> = row_indices.iter().filter_map(|&i| values[i]).collect();
        let mean = column.iter().sum::<f64>() / n as f64;
        let std = sample_std(&column, mean).unwrap_or(0.0);
        for (r, x) in column.iter().enumerate() {
            data[r][j] = if std > 0.0 { (x - mean) / std } else { 0.0 };
        }
    }

    let mut cov = vec![vec![0.0; p]; p];
    for row in &data {
        for a in 0..p {
            for b in a..p {
                cov[a][b] += row[a] * row[b];
            }
        }
    }
    for a in 0..p {
        for b in a..p {
            cov[a][b] /= (n - 1) as f64;
            cov[b][a] = cov[a][b];
        }
    }

    let (eigenvalues, eigenvectors) = symmetric_eigen(cov);
    let total: f64 = eigenvalues.iter().map(|v| v.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }

    let components = data
        .iter()
        .map(|row| {
            let score = |k: usize| (0..p).map(|j| row[j] * eigenvectors[k][j]).sum::<f64>();
            [score(0), score(1)]
        })
        .collect();
    let loadings = numeric
        .iter()
        .enumerate()
        .map(|(j, (name, _))| (name.clone(), [eigenvectors[0][j], eigenvectors[1][j]]))
        .collect();

    Some(Projection {
        columns: numeric.iter().map(|(name, _)| name.clone()).collect(),
        row_indices,
        components,
        explained_variance_ratio: [
            eigenvalues[0].max(0.0) / total,
            eigenvalues[1].max(0.0) / total,
        ],
        loadings,
    })
}

/// Cyclic Jacobi eigen decomposition of a symmetric matrix.
///
/// Returns eigenvalues in descending order and the matching unit
/// eigenvectors, each oriented so its largest-magnitude entry is positive.
fn symmetric_eigen(mut a: Vec<Vec<f64>>) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = a.len();
    let mut v: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for _ in 0..100 {
        let off: f64 = (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .map(|(i, j)| a[i][j] * a[i][j])
            .sum();
        if off < 1e-22 {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                if a[p][q].abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for row in a.iter_mut() {
                    let (kp, kq) = (row[p], row[q]);
                    row[p] = c * kp - s * kq;
                    row[q] = s * kp + c * kq;
                }
                for k in 0..n {
                    let (pk, qk) = (a[p][k], a[q][k]);
                    a[p][k] = c * pk - s * qk;
                    a[q][k] = s * pk + c * qk;
                }
                for row in v.iter_mut() {
                    let (kp, kq) = (row[p], row[q]);
                    row[p] = c * kp - s * kq;
                    row[q] = s * kp + c * kq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| a[y][y].total_cmp(&a[x][x]));
    let eigenvalues = order.iter().map(|&k| a[k][k]).collect();
    let eigenvectors = order
        .iter()
        .map(|&k| {
            let mut vector: Vec<f64> = (0..n).map(|i| v[i][k]).collect();
            let dominant = vector
                .iter()
                .copied()
                .max_by(|x, y| x.abs().total_cmp(&y.abs()))
                .unwrap_or(0.0);
            if dominant < 0.0 {
                vector.iter_mut().for_each(|x| *x = -*x);
            }
            vector
        })
        .collect();
    (eigenvalues, eigenvectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::table::Column;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn sample() -> Table {
        Table::new(vec![
            Column::float("x", vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), None]),
            Column::float("y", vec![Some(2.0), Some(4.0), Some(6.0), Some(8.0), Some(10.0)]),
            Column::integer("z", vec![Some(5), Some(3), Some(4), Some(1), Some(2)]),
            Column::string("label", vec![Some("a"), Some("b"), Some("a"), None, Some("b")]),
        ])
        .unwrap()
    }

    #[test]
    fn test_summary_quantiles_and_sample_std() {
        let report = Analyzer::new(AnalysisConfig::default()).analyze(&sample()).unwrap();
        let y = &report.summary.as_ref().unwrap()["y"];
        assert_eq!(y.count, 5);
        assert_eq!(y.median, Some(6.0));
        assert_eq!(y.q25, Some(4.0));
        assert_eq!(y.q75, Some(8.0));
        assert!(approx(y.std.unwrap(), 10.0_f64.sqrt()));
        let x = &report.summary.as_ref().unwrap()["x"];
        assert_eq!(x.count, 4);
        assert!(approx(x.q25.unwrap(), 1.75));
        assert!(!report.summary.unwrap().contains_key("label"));
    }

    #[test]
    fn test_missing_counts_and_types() {
        let report = Analyzer::new(AnalysisConfig::default()).analyze(&sample()).unwrap();
        let missing = report.missing_values.unwrap();
        assert_eq!(missing["x"], 1);
        assert_eq!(missing["label"], 1);
        assert_eq!(report.column_types["z"], DataType::Integer);
    }

    #[test]
    fn test_pairwise_complete_correlation() {
        let report = Analyzer::new(AnalysisConfig::default()).analyze(&sample()).unwrap();
        let corr = report.correlations.unwrap();
        assert!(approx(corr.get("x", "y").unwrap(), 1.0));
        assert!(approx(corr.get("y", "x").unwrap(), 1.0));
        assert!(corr.get("y", "z").unwrap() < 0.0);
        assert!(corr.get("label", "x").is_none());
    }

    #[test]
    fn test_correlation_omitted_with_one_numeric_column() {
        let table = Table::new(vec![Column::float("x", vec![Some(1.0), Some(2.0)])]).unwrap();
        let report = Analyzer::new(AnalysisConfig::default()).analyze(&table).unwrap();
        assert!(report.correlations.is_none());
        assert!(report.projection.is_none());
    }

    #[test]
    fn test_constant_column_correlation_is_undefined() {
        let table = Table::new(vec![
            Column::float("a", vec![Some(1.0), Some(1.0), Some(1.0)]),
            Column::float("b", vec![Some(1.0), Some(2.0), Some(3.0)]),
        ])
        .unwrap();
        let report = Analyzer::new(AnalysisConfig::default()).analyze(&table).unwrap();
        assert_eq!(report.correlations.unwrap().get("a", "b"), None);
    }

    #[test]
    fn test_skewness_and_kurtosis() {
        let symmetric = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!(approx(skewness(&symmetric).unwrap(), 0.0));
        assert!(approx(excess_kurtosis(&symmetric).unwrap(), -1.2));
        assert!(skewness(&[1.0, 2.0, 10.0, 1.0]).unwrap() > 0.0);
        assert!(skewness(&[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_projection_captures_dominant_direction() {
        let table = Table::new(vec![
            Column::float("a", (0..10).map(|i| Some(i as f64)).collect()),
            Column::float("b", (0..10).map(|i| Some(2.0 * i as f64 + 1.0)).collect()),
            Column::float(
                "c",
                (0..10).map(|i| Some(if i % 2 == 0 { 1.0 } else { -1.0 })).collect(),
            ),
        ])
        .unwrap();
        let projection = Analyzer::new(AnalysisConfig::default())
            .analyze(&table)
            .unwrap()
            .projection
            .unwrap();
        assert_eq!(projection.components.len(), 10);
        let ratio = projection.explained_variance_ratio;
        assert!(ratio[0] >= ratio[1]);
        assert!(ratio[0] > 0.6);
        assert!(ratio[0] + ratio[1] <= 1.0 + 1e-9);
        let la = projection.loadings["a"][0];
        let lb = projection.loadings["b"][0];
        assert!(approx(la, lb));
    }

    #[test]
    fn test_projection_requires_three_complete_rows() {
        let table = Table::new(vec![
            Column::float("a", vec![Some(1.0), Some(2.0), None]),
            Column::float("b", vec![Some(1.0), Some(3.0), Some(2.0)]),
            Column::float("c", vec![Some(0.0), Some(5.0), Some(1.0)]),
        ])
        .unwrap();
        let report = Analyzer::new(AnalysisConfig::default()).analyze(&table).unwrap();
        assert!(report.projection.is_none());
    }

    #[test]
    fn test_disabled_sections_are_absent() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"perform_correlation": false, "distributions": false}"#)
                .unwrap();
        let report = Analyzer::new(config).analyze(&sample()).unwrap();
        assert!(report.correlations.is_none());
        assert!(report.distributions.is_none());
        assert!(report.summary.is_some());
    }

    #[test]
    fn test_jacobi_diagonalizes() {
        let (values, vectors) = symmetric_eigen(vec![vec![2.0, 1.0], vec![1.0, 2.0]]);
        assert!(approx(values[0], 3.0));
        assert!(approx(values[1], 1.0));
        assert!(approx(vectors[0][0], vectors[0][1]));
    }

    #[test]
    fn test_cancelled_analysis() {
        let token = CancellationToken::new();
        token.cancel();
        let err = Analyzer::new(AnalysisConfig::default())
            .with_cancellation(token)
            .analyze(&sample())
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
