//! Error types for the prepline-core crate.
//!
//! Stage failures are recorded on the run and never escape the orchestrator;
//! only configuration errors and unavailable input propagate to callers.

use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Input unavailable for run {run_id}: {message}")]
    Input { run_id: Uuid, message: String },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Invalid table: {0}")]
    InvalidTable(String),

    #[error("Cyclic structure detected at {path}")]
    CyclicStructure { path: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: Uuid },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration load error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn stage(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn invalid_table(msg: impl Into<String>) -> Self {
        Self::InvalidTable(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
