//! # prepline-core: Tabular Dataset Preparation Pipeline
//!
//! Validates, cleans, analyzes and augments tabular datasets in one run.
//!
//! ## Stages
//!
//! A run moves a [`Table`] through up to five stages, each gated by the
//! [`PipelineConfig`]:
//! 1. **Initial validation**: schema rules and quality checks ([`validate`])
//! 2. **Preprocessing**: imputation, outlier replacement, scaling, interaction
//!    features and categorical encoding ([`transform`])
//! 3. **Analysis**: summary statistics, correlations, distributions and a
//!    two-component projection ([`analysis`])
//! 4. **Augmentation**: synthetic rows from one of several strategies ([`augment`])
//! 5. **Final validation**: the same rules, against the output table
//!
//! Stage failures are recorded on the [`PipelineRun`] and the run carries on
//! with the previous table. The [`Orchestrator`] keeps the run registry and
//! optionally persists every stage's table and report.

// Foundation
pub mod config;
pub mod error;
pub mod normalize;

// Table model & loading
pub mod data;

// Stages
pub mod analysis;
pub mod augment;
pub mod transform;
pub mod validate;

// Orchestration
pub mod pipeline;

// Re-exports
pub use analysis::{AnalysisConfig, AnalysisReport, Analyzer};
pub use augment::{AugmentationConfig, AugmentationEngine, AugmentationMethod, AugmentationReport};
pub use config::{PipelineConfig, load_config};
pub use data::{Cell, Column, ColumnData, DataType, Table, TableBuilder};
pub use error::PipelineError;
pub use normalize::{NativeValue, normalize, to_portable};
pub use pipeline::{ArtifactStore, Orchestrator, PipelineInput, PipelineRun, RunStatus, Stage};
pub use transform::{ColumnTransformer, PreprocessingConfig, TransformOutput};
pub use validate::{ValidationReport, ValidationRules, ValueRange};
