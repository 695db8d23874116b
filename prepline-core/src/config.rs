//! Pipeline configuration.
//!
//! Every section has serde defaults, so a partial TOML or JSON document is a
//! valid configuration. [`load_config`] layers defaults, a config file,
//! `PREPLINE_`-prefixed environment variables and explicit overrides.

use crate::analysis::AnalysisConfig;
use crate::augment::AugmentationConfig;
use crate::error::PipelineError;
use crate::transform::PreprocessingConfig;
use crate::validate::ValidationRules;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

/// Complete configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub perform_initial_validation: bool,
    #[serde(default = "default_true")]
    pub perform_preprocessing: bool,
    #[serde(default = "default_true")]
    pub perform_analysis: bool,
    #[serde(default)]
    pub perform_augmentation: bool,
    #[serde(default = "default_true")]
    pub perform_final_validation: bool,
    /// Rules applied by both validation stages.
    #[serde(default)]
    pub validation_config: ValidationRules,
    #[serde(default)]
    pub preprocessing_config: PreprocessingConfig,
    #[serde(default)]
    pub analysis_config: AnalysisConfig,
    #[serde(default)]
    pub augmentation_config: AugmentationConfig,
    /// Persist each stage's table and report under the artifact root.
    #[serde(default)]
    pub save_intermediate: bool,
    /// Artifact root; the orchestrator's default is used when unset.
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            perform_initial_validation: true,
            perform_preprocessing: true,
            perform_analysis: true,
            perform_augmentation: false,
            perform_final_validation: true,
            validation_config: ValidationRules::default(),
            preprocessing_config: PreprocessingConfig::default(),
            analysis_config: AnalysisConfig::default(),
            augmentation_config: AugmentationConfig::default(),
            save_intermediate: false,
            artifact_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Reject malformed settings before any stage runs. Sections of disabled
    /// stages are not checked.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.perform_initial_validation || self.perform_final_validation {
            self.validation_config.check()?;
        }
        if self.perform_preprocessing {
            self.preprocessing_config.check()?;
        }
        if self.perform_augmentation {
            self.augmentation_config.check()?;
        }
        Ok(())
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, PipelineError> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::config(e.to_string()))
    }
}

/// Load configuration with layered sources.
///
/// Precedence (lowest to highest): defaults, `path` (TOML, or JSON when the
/// extension is `.json`), `PREPLINE_*` environment variables with `__` as the
/// nesting separator, then `overrides`.
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&PipelineConfig>,
) -> Result<PipelineConfig, PipelineError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(PipelineError::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        figment = if is_json {
            figment.merge(Json::file(path))
        } else {
            figment.merge(Toml::file(path))
        };
    }

    // PREPLINE_AUGMENTATION_CONFIG__FACTOR=1.0, PREPLINE_SAVE_INTERMEDIATE=true, ...
    figment = figment.merge(Env::prefixed("PREPLINE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: PipelineConfig = figment.extract().map_err(Box::new)?;
    config.check()?;
    Ok(config)
}
