//! Run orchestration: stage sequencing, the run registry, and artifact storage.

pub mod orchestrator;
pub mod run;
pub mod storage;

pub use orchestrator::{Orchestrator, PipelineInput};
pub use run::{OutputReference, PipelineRun, RunStatus, Stage};
pub use storage::ArtifactStore;
