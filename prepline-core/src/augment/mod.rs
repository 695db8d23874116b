//! Augmentation engine: appends synthetic rows and reports how far their
//! distribution drifts from the original rows.
//!
//! The method is parsed once from configuration into [`AugmentationMethod`];
//! each variant builds an [`Augmenter`] strategy.

pub mod sampling;
pub mod strategies;

pub use strategies::{
    Augmenter, ClassBalance, GaussianNoise, GenerationContext, Mixup, RandomInterpolation,
    RandomOversampling, Smote, TimeWarp,
};

use crate::data::table::Table;
use crate::error::PipelineError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// Supported augmentation methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AugmentationMethod {
    #[default]
    Mixup,
    RandomInterpolation,
    GaussianNoise,
    TimeWarp,
    Smote,
    RandomOversampling,
}

impl AugmentationMethod {
    pub fn requires_target(self) -> bool {
        matches!(self, Self::Smote | Self::RandomOversampling)
    }
}

impl fmt::Display for AugmentationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mixup => "mixup",
            Self::RandomInterpolation => "random_interpolation",
            Self::GaussianNoise => "gaussian_noise",
            Self::TimeWarp => "time_warp",
            Self::Smote => "smote",
            Self::RandomOversampling => "random_oversampling",
        };
        write!(f, "{name}")
    }
}

impl FromStr for AugmentationMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mixup" => Ok(Self::Mixup),
            "random_interpolation" | "interpolation" => Ok(Self::RandomInterpolation),
            "gaussian_noise" | "noise" => Ok(Self::GaussianNoise),
            "time_warp" | "time_warping" => Ok(Self::TimeWarp),
            "smote" => Ok(Self::Smote),
            "random_oversampling" | "oversampling" => Ok(Self::RandomOversampling),
            other => Err(PipelineError::config(format!(
                "Unsupported augmentation method: {other}"
            ))),
        }
    }
}

fn default_factor() -> f64 {
    0.5
}

fn default_noise_scale() -> f64 {
    0.1
}

fn default_mixup_alpha() -> f64 {
    0.4
}

fn default_k_neighbors() -> usize {
    5
}

fn default_jitter_std() -> f64 {
    2.0
}

/// Augmentation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    #[serde(default)]
    pub method: AugmentationMethod,
    /// Fraction of the input row count to synthesize.
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub target_column: Option<String>,
    #[serde(default, alias = "random_state")]
    pub random_seed: Option<u64>,
    /// Noise std as a fraction of each column's std.
    #[serde(default = "default_noise_scale")]
    pub noise_scale: f64,
    #[serde(default = "default_mixup_alpha")]
    pub mixup_alpha: f64,
    #[serde(default = "default_k_neighbors")]
    pub k_neighbors: usize,
    #[serde(default)]
    pub time_column: Option<String>,
    #[serde(default = "default_jitter_std")]
    pub jitter_std: f64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            method: AugmentationMethod::default(),
            factor: default_factor(),
            target_column: None,
            random_seed: None,
            noise_scale: default_noise_scale(),
            mixup_alpha: default_mixup_alpha(),
            k_neighbors: default_k_neighbors(),
            time_column: None,
            jitter_std: default_jitter_std(),
        }
    }
}

impl AugmentationConfig {
    pub fn check(&self) -> Result<(), PipelineError> {
        if !self.factor.is_finite() || self.factor < 0.0 {
            return Err(PipelineError::config(format!(
                "augmentation factor must be a non-negative number, got {}",
                self.factor
            )));
        }
        if self.mixup_alpha <= 0.0 || !self.mixup_alpha.is_finite() {
            return Err(PipelineError::config("mixup_alpha must be positive"));
        }
        if self.noise_scale < 0.0 || self.jitter_std < 0.0 {
            return Err(PipelineError::config(
                "noise_scale and jitter_std must be non-negative",
            ));
        }
        if self.method.requires_target() && self.target_column.is_none() {
            return Err(PipelineError::config(format!(
                "{} requires target_column",
                self.method
            )));
        }
        Ok(())
    }

    /// Build the strategy for the configured method.
    pub fn build(&self) -> Result<Box<dyn Augmenter>, PipelineError> {
        self.check()?;
        let target = || self.target_column.clone().unwrap_or_default();
        Ok(match self.method {
            AugmentationMethod::Mixup => Box::new(Mixup {
                alpha: self.mixup_alpha,
            }),
            AugmentationMethod::RandomInterpolation => Box::new(RandomInterpolation),
            AugmentationMethod::GaussianNoise => Box::new(GaussianNoise {
                scale: self.noise_scale,
            }),
            AugmentationMethod::TimeWarp => Box::new(TimeWarp {
                time_column: self.time_column.clone(),
                jitter_std: self.jitter_std,
            }),
            AugmentationMethod::Smote => Box::new(Smote {
                target_column: target(),
                k_neighbors: self.k_neighbors,
            }),
            AugmentationMethod::RandomOversampling => Box::new(RandomOversampling {
                target_column: target(),
            }),
        })
    }
}

/// Original-versus-synthetic statistics for one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureShift {
    pub original_mean: Option<f64>,
    pub synthetic_mean: Option<f64>,
    pub mean_shift: Option<f64>,
    pub original_std: Option<f64>,
    pub synthetic_std: Option<f64>,
    pub std_shift: Option<f64>,
    pub original_min: Option<f64>,
    pub synthetic_min: Option<f64>,
    pub original_max: Option<f64>,
    pub synthetic_max: Option<f64>,
}

impl FeatureShift {
    fn between(original: &[f64], synthetic: &[f64]) -> Self {
        let mean = |v: &[f64]| (!v.is_empty()).then(|| v.iter().sum::<f64>() / v.len() as f64);
        let min = |v: &[f64]| v.iter().copied().reduce(f64::min);
        let max = |v: &[f64]| v.iter().copied().reduce(f64::max);
        let diff = |a: Option<f64>, b: Option<f64>| Some(b? - a?);

        let original_mean = mean(original);
        let synthetic_mean = mean(synthetic);
        let original_std = strategies::sample_std(original);
        let synthetic_std = strategies::sample_std(synthetic);
        Self {
            original_mean,
            synthetic_mean,
            mean_shift: diff(original_mean, synthetic_mean),
            original_std,
            synthetic_std,
            std_shift: diff(original_std, synthetic_std),
            original_min: min(original),
            synthetic_min: min(synthetic),
            original_max: max(original),
            synthetic_max: max(synthetic),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationReport {
    pub method: AugmentationMethod,
    pub original_row_count: usize,
    pub synthetic_row_count: usize,
    /// Total rows after augmentation.
    pub augmented_row_count: usize,
    /// `augmented_row_count / original_row_count`; 1.0 for an empty input.
    pub augmentation_ratio: f64,
    pub distribution_shift: BTreeMap<String, FeatureShift>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_balance: Option<ClassBalance>,
}

/// Expanded table plus its report.
#[derive(Debug, Clone)]
pub struct AugmentationOutput {
    pub table: Table,
    pub report: AugmentationReport,
}

/// Runs one configured strategy against tables.
pub struct AugmentationEngine {
    config: AugmentationConfig,
    strategy: Box<dyn Augmenter>,
    cancel: CancellationToken,
}

impl AugmentationEngine {
    pub fn new(config: AugmentationConfig) -> Result<Self, PipelineError> {
        let strategy = config.build()?;
        Ok(Self {
            config,
            strategy,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn augment(&self, table: &Table) -> Result<AugmentationOutput, PipelineError> {
        let original = table.row_count();
        let requested = (original as f64 * self.config.factor).floor() as usize;
        let rng = match self.config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut ctx = GenerationContext::new(rng, self.cancel.clone());

        tracing::info!(
            method = self.strategy.name(),
            rows = original,
            requested,
            "Generating synthetic rows"
        );
        let synthetic = self.strategy.generate(table, requested, &mut ctx)?;
        let expanded = table.with_appended_rows(&synthetic)?;

        let distribution_shift = table
            .columns()
            .iter()
            .zip(expanded.columns())
            .filter(|(c, _)| c.dtype().is_numeric())
            .map(|(before, after)| {
                let synthetic_values: Vec<f64> = after
                    .data
                    .as_f64()
                    .map(|v| v[original..].iter().flatten().copied().collect())
                    .unwrap_or_default();
                (
                    before.name.clone(),
                    FeatureShift::between(&before.data.present_f64(), &synthetic_values),
                )
            })
            .collect();

        let augmented = expanded.row_count();
        let report = AugmentationReport {
            method: self.config.method,
            original_row_count: original,
            synthetic_row_count: synthetic.len(),
            augmented_row_count: augmented,
            augmentation_ratio: if original == 0 {
                1.0
            } else {
                augmented as f64 / original as f64
            },
            distribution_shift,
            warnings: ctx.warnings,
            class_balance: ctx.class_balance,
        };
        tracing::info!(
            method = self.strategy.name(),
            synthetic = report.synthetic_row_count,
            total = augmented,
            "Augmentation finished"
        );
        Ok(AugmentationOutput {
            table: expanded,
            report,
        })
    }
}

/// One-shot augmentation with an explicit method, factor, target and seed.
pub fn augment(
    table: &Table,
    method: AugmentationMethod,
    factor: f64,
    target_column: Option<&str>,
    seed: Option<u64>,
) -> Result<(Table, AugmentationReport), PipelineError> {
    let config = AugmentationConfig {
        method,
        factor,
        target_column: target_column.map(str::to_string),
        random_seed: seed,
        ..Default::default()
    };
    let output = AugmentationEngine::new(config)?.augment(table)?;
    Ok((output.table, output.report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::table::{Cell, Column};
    use pretty_assertions::assert_eq;

    fn numbers() -> Table {
        Table::new(vec![
            Column::integer("age", (0..10).map(|i| Some(20 + i)).collect()),
            Column::float("score", (0..10).map(|i| Some(i as f64 / 2.0)).collect()),
            Column::string("city", (0..10).map(|i| Some(if i % 2 == 0 { "Oslo" } else { "Rome" })).collect()),
        ])
        .unwrap()
    }

    #[test]
    fn test_seeded_mixup_is_deterministic() {
        let table = numbers();
        let (first, _) = augment(&table, AugmentationMethod::Mixup, 0.5, None, Some(42)).unwrap();
        let (second, _) = augment(&table, AugmentationMethod::Mixup, 0.5, None, Some(42)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.row_count(), 15);
    }

    #[test]
    fn test_original_rows_are_untouched_and_integers_rounded() {
        let table = numbers();
        let (expanded, report) =
            augment(&table, AugmentationMethod::RandomInterpolation, 0.3, None, Some(1)).unwrap();
        for i in 0..table.row_count() {
            assert_eq!(expanded.row(i), table.row(i));
        }
        for i in table.row_count()..expanded.row_count() {
            assert!(matches!(expanded.row(i)[0], Cell::Integer(_)));
        }
        assert_eq!(report.original_row_count, 10);
        assert_eq!(report.synthetic_row_count, 3);
        assert_eq!(report.augmented_row_count, 13);
        assert!((report.augmentation_ratio - 1.3).abs() < 1e-12);
        assert!(report.distribution_shift.contains_key("score"));
        assert!(!report.distribution_shift.contains_key("city"));
    }

    #[test]
    fn test_zero_factor_adds_nothing() {
        let (expanded, report) =
            augment(&numbers(), AugmentationMethod::GaussianNoise, 0.0, None, Some(3)).unwrap();
        assert_eq!(expanded.row_count(), 10);
        assert_eq!(report.synthetic_row_count, 0);
    }

    #[test]
    fn test_time_warp_without_timestamps_is_stage_error() {
        let err = augment(&numbers(), AugmentationMethod::TimeWarp, 0.5, None, Some(3)).unwrap_err();
        assert!(matches!(err, PipelineError::Stage { .. }));
    }

    #[test]
    fn test_smote_balances_classes() {
        let table = Table::new(vec![
            Column::float("f1", (0..12).map(|i| Some(i as f64)).collect()),
            Column::float("f2", (0..12).map(|i| Some((i * i) as f64)).collect()),
            Column::string(
                "label",
                (0..12).map(|i| Some(if i < 9 { "major" } else { "minor" })).collect(),
            ),
        ])
        .unwrap();
        let (expanded, report) =
            augment(&table, AugmentationMethod::Smote, 0.0, Some("label"), Some(7)).unwrap();
        assert_eq!(expanded.row_count(), 18);
        let balance = report.class_balance.unwrap();
        assert_eq!(balance.after["major"], 9);
        assert_eq!(balance.after["minor"], 9);
        let minor = (0..expanded.row_count())
            .filter(|&i| expanded.row(i)[2] == Cell::String("minor".into()))
            .count();
        assert_eq!(minor, 9);
    }

    #[test]
    fn test_config_requires_target_for_smote() {
        let config = AugmentationConfig {
            method: AugmentationMethod::Smote,
            ..Default::default()
        };
        assert!(matches!(config.build(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_config_parses_random_state_alias() {
        let config: AugmentationConfig =
            serde_json::from_str(r#"{"method": "time_warp", "random_state": 9, "factor": 1.0}"#)
                .unwrap();
        assert_eq!(config.method, AugmentationMethod::TimeWarp);
        assert_eq!(config.random_seed, Some(9));
        assert_eq!(config.k_neighbors, 5);
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!(
            "Gaussian_Noise".parse::<AugmentationMethod>().unwrap(),
            AugmentationMethod::GaussianNoise
        );
        assert!("rotate".parse::<AugmentationMethod>().is_err());
    }
}
