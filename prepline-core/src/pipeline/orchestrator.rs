//! Pipeline orchestrator: sequences stages, keeps the run registry, and
//! persists artifacts when asked to.

use crate::analysis::Analyzer;
use crate::augment::AugmentationEngine;
use crate::config::PipelineConfig;
use crate::data::source::source_for_path;
use crate::data::table::Table;
use crate::error::PipelineError;
use crate::normalize::to_portable;
use crate::pipeline::run::{OutputReference, PipelineRun, RunStatus, Stage};
use crate::pipeline::storage::ArtifactStore;
use crate::transform::ColumnTransformer;
use crate::validate::validate;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Data handed to a run: an in-memory table or a file to load.
#[derive(Debug, Clone)]
pub enum PipelineInput {
    Table(Table),
    Path(PathBuf),
}

impl From<Table> for PipelineInput {
    fn from(table: Table) -> Self {
        PipelineInput::Table(table)
    }
}

impl From<PathBuf> for PipelineInput {
    fn from(path: PathBuf) -> Self {
        PipelineInput::Path(path)
    }
}

impl From<&std::path::Path> for PipelineInput {
    fn from(path: &std::path::Path) -> Self {
        PipelineInput::Path(path.to_path_buf())
    }
}

/// What a successful stage hands back to the orchestrator.
struct StageOutcome {
    table: Option<Table>,
    report: Value,
    errors: Vec<String>,
    warnings: Vec<String>,
}

/// Runs pipelines and tracks their state.
#[derive(Clone, Default)]
pub struct Orchestrator {
    runs: Arc<Mutex<HashMap<Uuid, PipelineRun>>>,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    /// Where each persisted run's artifacts live, including runs whose
    /// config named its own `artifact_dir`.
    run_stores: Arc<Mutex<HashMap<Uuid, ArtifactStore>>>,
    store: Option<ArtifactStore>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `root` for artifacts of runs whose config has no `artifact_dir`,
    /// and as a fallback when looking up runs that are not in memory.
    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store = Some(ArtifactStore::new(root));
        self
    }

    pub fn artifact_store(&self) -> Option<&ArtifactStore> {
        self.store.as_ref()
    }

    /// Run the pipeline under a fresh run id.
    pub async fn run(
        &self,
        input: impl Into<PipelineInput>,
        config: PipelineConfig,
    ) -> Result<PipelineRun, PipelineError> {
        self.run_with_id(Uuid::new_v4(), input, config).await
    }

    pub async fn run_with_id(
        &self,
        run_id: Uuid,
        input: impl Into<PipelineInput>,
        config: PipelineConfig,
    ) -> Result<PipelineRun, PipelineError> {
        self.run_with_cancellation(run_id, input, config, CancellationToken::new())
            .await
    }

    /// Run the pipeline, stopping early once `token` is cancelled.
    ///
    /// Configuration errors are returned before the run is registered. A run
    /// whose input cannot be loaded is recorded as failed and the error is
    /// returned as [`PipelineError::Input`]. Every other outcome, including
    /// failed stages and cancellation, is reported through the returned run.
    pub async fn run_with_cancellation(
        &self,
        run_id: Uuid,
        input: impl Into<PipelineInput>,
        config: PipelineConfig,
        token: CancellationToken,
    ) -> Result<PipelineRun, PipelineError> {
        config.check()?;

        let mut run = PipelineRun::new(run_id, config);
        self.publish(&run).await;
        self.active.lock().await.insert(run_id, token.clone());
        tracing::info!(run_id = %run_id, "Pipeline run started");

        let result = self.execute(&mut run, input.into(), &token).await;

        self.active.lock().await.remove(&run_id);
        self.publish(&run).await;
        tracing::info!(
            run_id = %run_id,
            status = %run.status,
            errors = run.errors.len(),
            duration_ms = run.duration_ms.unwrap_or_default(),
            "Pipeline run finished"
        );
        result.map(|()| run)
    }

    /// Signal cancellation to an active run. Returns the run's status at the
    /// time of the call; finished runs are left untouched.
    pub async fn cancel(&self, run_id: Uuid) -> Result<RunStatus, PipelineError> {
        if let Some(token) = self.active.lock().await.get(&run_id) {
            token.cancel();
            tracing::info!(run_id = %run_id, "Cancellation requested");
        }
        let runs = self.runs.lock().await;
        runs.get(&run_id)
            .map(|run| run.status)
            .ok_or(PipelineError::RunNotFound { run_id })
    }

    /// Look a run up in memory, then in the store it was persisted to, then
    /// in the default artifact root.
    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, PipelineError> {
        if let Some(run) = self.runs.lock().await.get(&run_id) {
            return Ok(run.clone());
        }
        let persisted = self.run_stores.lock().await.get(&run_id).cloned();
        if let Some(store) = &persisted {
            if let Some(run) = store.load_run(run_id)? {
                return Ok(run);
            }
        }
        if let Some(store) = &self.store {
            if let Some(run) = store.load_run(run_id)? {
                return Ok(run);
            }
        }
        Err(PipelineError::RunNotFound { run_id })
    }

    /// All runs in memory, oldest first.
    pub async fn list_runs(&self) -> Vec<PipelineRun> {
        let runs = self.runs.lock().await;
        let mut list: Vec<PipelineRun> = runs.values().cloned().collect();
        list.sort_by_key(|run| run.start_time);
        list
    }

    /// Drop finished runs older than `max_age` from memory and from every
    /// artifact root this orchestrator has written to. Artifacts of runs that
    /// are still in progress are kept. Returns the removed run ids.
    pub async fn cleanup(&self, max_age: Duration) -> Result<Vec<Uuid>, PipelineError> {
        let age = chrono::Duration::from_std(max_age)
            .map_err(|e| PipelineError::config(format!("invalid max age: {e}")))?;
        let cutoff = chrono::Utc::now() - age;

        let (mut removed, in_progress) = {
            let mut runs = self.runs.lock().await;
            let expired: Vec<Uuid> = runs
                .values()
                .filter(|run| run.status.is_terminal() && run.last_activity() < cutoff)
                .map(|run| run.run_id)
                .collect();
            for run_id in &expired {
                runs.remove(run_id);
            }
            let in_progress: HashSet<Uuid> = runs
                .values()
                .filter(|run| !run.status.is_terminal())
                .map(|run| run.run_id)
                .collect();
            (expired, in_progress)
        };

        for store in self.artifact_stores().await {
            removed.extend(store.cleanup_except(max_age, &in_progress)?);
        }
        removed.sort();
        removed.dedup();
        self.run_stores
            .lock()
            .await
            .retain(|run_id, store| store.run_dir(*run_id).exists());
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "Cleaned up expired runs");
        }
        Ok(removed)
    }

    /// The default store plus every other root a run was persisted to.
    async fn artifact_stores(&self) -> Vec<ArtifactStore> {
        let mut stores: Vec<ArtifactStore> = self.store.iter().cloned().collect();
        for store in self.run_stores.lock().await.values() {
            if !stores.iter().any(|known| known.root() == store.root()) {
                stores.push(store.clone());
            }
        }
        stores
    }

    async fn publish(&self, run: &PipelineRun) {
        self.runs
            .lock()
            .await
            .insert(run.run_id, run.without_table());
    }

    fn store_for(&self, config: &PipelineConfig) -> Option<ArtifactStore> {
        config
            .artifact_dir
            .as_ref()
            .map(ArtifactStore::new)
            .or_else(|| self.store.clone())
    }

    async fn execute(
        &self,
        run: &mut PipelineRun,
        input: PipelineInput,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let run_id = run.run_id;
        let store = if run.config.save_intermediate {
            let store = self.store_for(&run.config);
            if store.is_none() {
                run.record_warning(
                    "persistence",
                    "save_intermediate is set but no artifact directory is configured",
                );
            }
            store
        } else {
            None
        };
        if let Some(store) = &store {
            self.run_stores.lock().await.insert(run_id, store.clone());
        }

        let table = match load_input(run, input).await {
            Ok(table) => table,
            Err(e) => {
                let message = stage_message(&e);
                tracing::warn!(run_id = %run_id, error = %message, "Failed to load input");
                run.record_error("input", &message);
                run.finish(RunStatus::Failed);
                persist_run(run, store.as_ref());
                return Err(PipelineError::Input { run_id, message });
            }
        };

        let mut current = Arc::new(table);
        let config = Arc::new(run.config.clone());
        let mut cancelled_in: Option<&'static str> = None;

        for stage in Stage::ALL {
            if !stage.enabled(&config) {
                continue;
            }
            if token.is_cancelled() {
                cancelled_in = Some(stage.name());
                break;
            }

            run.status = stage.status();
            self.publish(run).await;
            tracing::info!(run_id = %run_id, stage = %stage, rows = current.row_count(), "Stage started");

            let started = Instant::now();
            let outcome = run_stage(stage, current.clone(), config.clone(), token.clone()).await;
            let elapsed = started.elapsed();
            run.stages_executed.push(stage);
            run.stage_durations_ms.insert(
                stage.name().to_string(),
                u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            );

            match outcome {
                Ok(outcome) => {
                    for error in &outcome.errors {
                        run.record_error(stage.name(), error);
                    }
                    for warning in &outcome.warnings {
                        run.record_warning(stage.name(), warning);
                    }
                    if let Some(table) = outcome.table {
                        current = Arc::new(table);
                    }
                    if let Some(store) = &store {
                        if let Err(e) =
                            store.save_stage(run_id, stage, &current, &outcome.report, elapsed)
                        {
                            tracing::warn!(run_id = %run_id, stage = %stage, error = %e, "Failed to save stage artifacts");
                            run.record_warning("persistence", e);
                        }
                    }
                    run.stage_results.insert(stage.name().to_string(), outcome.report);
                    tracing::info!(
                        run_id = %run_id,
                        stage = %stage,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Stage finished"
                    );
                }
                Err(e) if e.is_cancelled() => {
                    cancelled_in = Some(stage.name());
                    break;
                }
                Err(e) => {
                    let message = stage_message(&e);
                    tracing::warn!(run_id = %run_id, stage = %stage, error = %message, "Stage failed");
                    run.record_error(stage.name(), &message);
                    run.stages_failed.push(stage);
                    run.stage_results.insert(
                        stage.name().to_string(),
                        serde_json::json!({ "error": message }),
                    );
                }
            }
        }

        if let Some(stage) = cancelled_in {
            tracing::warn!(run_id = %run_id, stage, "Pipeline run cancelled");
            run.record_error(stage, "cancelled");
            run.finish(RunStatus::Failed);
            persist_run(run, store.as_ref());
            return Ok(());
        }

        let all_failed =
            !run.stages_executed.is_empty() && run.stages_failed.len() == run.stages_executed.len();
        run.output = Some(OutputReference {
            rows: current.row_count(),
            columns: current.column_count(),
            column_names: current.column_names(),
            artifact_path: store.as_ref().map(|s| s.run_dir(run_id)),
        });
        run.final_table = Some(Arc::try_unwrap(current).unwrap_or_else(|shared| (*shared).clone()));
        run.finish(if all_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        });
        persist_run(run, store.as_ref());
        Ok(())
    }
}

async fn load_input(run: &mut PipelineRun, input: PipelineInput) -> Result<Table, PipelineError> {
    match input {
        PipelineInput::Table(table) => Ok(table),
        PipelineInput::Path(path) => {
            let source = source_for_path(&path)?;
            run.source = Some(source.source_info());
            source.load(None).await
        }
    }
}

fn persist_run(run: &mut PipelineRun, store: Option<&ArtifactStore>) {
    let Some(store) = store else {
        return;
    };
    if let Err(e) = store.save_run(run) {
        tracing::warn!(run_id = %run.run_id, error = %e, "Failed to save run record");
        run.record_warning("persistence", e);
    }
}

/// Message recorded on the run for a stage error, without the stage prefix
/// the error's own display would add.
fn stage_message(error: &PipelineError) -> String {
    match error {
        PipelineError::Stage { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

async fn run_stage(
    stage: Stage,
    table: Arc<Table>,
    config: Arc<PipelineConfig>,
    cancel: CancellationToken,
) -> Result<StageOutcome, PipelineError> {
    tokio::task::spawn_blocking(move || execute_stage(stage, &table, &config, cancel))
        .await
        .map_err(|e| PipelineError::stage(stage.name(), format!("stage task failed: {e}")))?
}

fn execute_stage(
    stage: Stage,
    table: &Table,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> Result<StageOutcome, PipelineError> {
    match stage {
        Stage::InitialValidation | Stage::FinalValidation => {
            let report = validate(table, &config.validation_config)?;
            Ok(StageOutcome {
                table: None,
                report: to_portable(&report)?,
                errors: Vec::new(),
                warnings: report.violations,
            })
        }
        Stage::Preprocessing => {
            let output = ColumnTransformer::new(config.preprocessing_config.clone())?
                .with_cancellation(cancel)
                .transform(table)?;
            Ok(StageOutcome {
                report: to_portable(&output)?,
                errors: output.errors,
                warnings: output.warnings,
                table: Some(output.table),
            })
        }
        Stage::Analysis => {
            let report = Analyzer::new(config.analysis_config.clone())
                .with_cancellation(cancel)
                .analyze(table)?;
            Ok(StageOutcome {
                table: None,
                report: to_portable(&report)?,
                errors: Vec::new(),
                warnings: Vec::new(),
            })
        }
        Stage::Augmentation => {
            let output = AugmentationEngine::new(config.augmentation_config.clone())?
                .with_cancellation(cancel)
                .augment(table)?;
            Ok(StageOutcome {
                report: to_portable(&output.report)?,
                errors: Vec::new(),
                warnings: output.report.warnings,
                table: Some(output.table),
            })
        }
    }
}
