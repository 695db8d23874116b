//! Pipeline run state and stage identifiers.

use crate::config::PipelineConfig;
use crate::data::source::SourceInfo;
use crate::data::table::Table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    ValidatingInitial,
    Transforming,
    Analyzing,
    Augmenting,
    ValidatingFinal,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Created => write!(f, "created"),
            RunStatus::ValidatingInitial => write!(f, "validating_initial"),
            RunStatus::Transforming => write!(f, "transforming"),
            RunStatus::Analyzing => write!(f, "analyzing"),
            RunStatus::Augmenting => write!(f, "augmenting"),
            RunStatus::ValidatingFinal => write!(f, "validating_final"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    InitialValidation,
    Preprocessing,
    Analysis,
    Augmentation,
    FinalValidation,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::InitialValidation,
        Stage::Preprocessing,
        Stage::Analysis,
        Stage::Augmentation,
        Stage::FinalValidation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::InitialValidation => "initial_validation",
            Stage::Preprocessing => "preprocessing",
            Stage::Analysis => "analysis",
            Stage::Augmentation => "augmentation",
            Stage::FinalValidation => "final_validation",
        }
    }

    /// Status a run is in while this stage executes.
    pub fn status(self) -> RunStatus {
        match self {
            Stage::InitialValidation => RunStatus::ValidatingInitial,
            Stage::Preprocessing => RunStatus::Transforming,
            Stage::Analysis => RunStatus::Analyzing,
            Stage::Augmentation => RunStatus::Augmenting,
            Stage::FinalValidation => RunStatus::ValidatingFinal,
        }
    }

    /// Whether `config` enables this stage.
    pub fn enabled(self, config: &PipelineConfig) -> bool {
        match self {
            Stage::InitialValidation => config.perform_initial_validation,
            Stage::Preprocessing => config.perform_preprocessing,
            Stage::Analysis => config.perform_analysis,
            Stage::Augmentation => config.perform_augmentation,
            Stage::FinalValidation => config.perform_final_validation,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape and location of the final table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputReference {
    pub rows: usize,
    pub columns: usize,
    pub column_names: Vec<String>,
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
}

/// Record of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub config: PipelineConfig,
    #[serde(default)]
    pub source: Option<SourceInfo>,
    /// Stage name to portable JSON report.
    #[serde(default)]
    pub stage_results: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub stages_executed: Vec<Stage>,
    #[serde(default)]
    pub stages_failed: Vec<Stage>,
    #[serde(default)]
    pub stage_durations_ms: BTreeMap<String, u64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub output: Option<OutputReference>,
    /// The final table. Only present on the value returned by the run itself.
    #[serde(skip)]
    pub final_table: Option<Table>,
}

impl PipelineRun {
    pub fn new(run_id: Uuid, config: PipelineConfig) -> Self {
        Self {
            run_id,
            status: RunStatus::Created,
            config,
            source: None,
            stage_results: BTreeMap::new(),
            stages_executed: Vec::new(),
            stages_failed: Vec::new(),
            stage_durations_ms: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            output: None,
            final_table: None,
        }
    }

    pub fn record_error(&mut self, stage: &str, message: impl fmt::Display) {
        self.errors.push(format!("{stage}: {message}"));
    }

    pub fn record_warning(&mut self, stage: &str, message: impl fmt::Display) {
        self.warnings.push(format!("{stage}: {message}"));
    }

    /// Freeze the run with a terminal status.
    pub fn finish(&mut self, status: RunStatus) {
        let end = Utc::now();
        self.status = status;
        self.end_time = Some(end);
        self.duration_ms = u64::try_from((end - self.start_time).num_milliseconds()).ok();
    }

    /// Copy without the final table, as kept in registries and on disk.
    pub fn without_table(&self) -> Self {
        Self {
            run_id: self.run_id,
            status: self.status,
            config: self.config.clone(),
            source: self.source.clone(),
            stage_results: self.stage_results.clone(),
            stages_executed: self.stages_executed.clone(),
            stages_failed: self.stages_failed.clone(),
            stage_durations_ms: self.stage_durations_ms.clone(),
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms: self.duration_ms,
            output: self.output.clone(),
            final_table: None,
        }
    }

    /// Time the run last changed state.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.end_time.unwrap_or(self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::ValidatingInitial).unwrap();
        assert_eq!(json, "\"validating_initial\"");
        assert_eq!(RunStatus::ValidatingFinal.to_string(), "validating_final");
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Analyzing.is_terminal());
    }

    #[test]
    fn test_stage_gates_follow_config() {
        let config = PipelineConfig::default();
        let enabled: Vec<&str> = Stage::ALL
            .iter()
            .filter(|s| s.enabled(&config))
            .map(|s| s.name())
            .collect();
        assert_eq!(
            enabled,
            vec!["initial_validation", "preprocessing", "analysis", "final_validation"]
        );
    }

    #[test]
    fn test_finish_sets_duration_and_errors_are_prefixed() {
        let mut run = PipelineRun::new(Uuid::new_v4(), PipelineConfig::default());
        run.record_error("augmentation", "no timestamp column");
        run.finish(RunStatus::Completed);
        assert_eq!(run.errors, vec!["augmentation: no timestamp column"]);
        assert!(run.end_time.is_some());
        assert!(run.duration_ms.is_some());
    }

    #[test]
    fn test_run_json_skips_table() {
        let mut run = PipelineRun::new(Uuid::new_v4(), PipelineConfig::default());
        run.final_table = Some(Table::empty());
        let value = serde_json::to_value(&run).unwrap();
        assert!(value.get("final_table").is_none());
        let back: PipelineRun = serde_json::from_value(value).unwrap();
        assert_eq!(back.run_id, run.run_id);
        assert!(back.final_table.is_none());
    }
}
