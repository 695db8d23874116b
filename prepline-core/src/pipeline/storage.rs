//! On-disk artifacts for pipeline runs.
//!
//! Layout under the root:
//!
//! ```text
//! {root}/{run_id}/run.json
//! {root}/{run_id}/{stage}/data.json
//! {root}/{run_id}/{stage}/metadata.json
//! ```
//!
//! All writes go through a `.tmp` sibling and a rename so readers never see a
//! partial file.

use crate::data::table::Table;
use crate::error::PipelineError;
use crate::normalize::{NativeValue, normalize};
use crate::pipeline::run::{PipelineRun, Stage};
use chrono::Utc;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const RUN_FILE: &str = "run.json";

/// Atomically write JSON data to a file, creating parent directories.
pub fn atomic_write_json<T: serde::Serialize + ?Sized>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file; `Ok(None)` if it doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Stores per-run artifacts below a root directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Write a stage's table and metadata. Returns the stage directory.
    pub fn save_stage(
        &self,
        run_id: Uuid,
        stage: Stage,
        table: &Table,
        report: &serde_json::Value,
        elapsed: Duration,
    ) -> Result<PathBuf, PipelineError> {
        let dir = self.run_dir(run_id).join(stage.name());
        atomic_write_json(&dir.join("data.json"), &table.to_records())?;

        let metadata = NativeValue::Map(vec![
            ("run_id".into(), run_id.to_string().as_str().into()),
            ("stage".into(), stage.name().into()),
            ("rows".into(), table.row_count().into()),
            ("columns".into(), table.column_count().into()),
            (
                "column_names".into(),
                NativeValue::Seq(
                    table
                        .column_names()
                        .iter()
                        .map(|n| n.as_str().into())
                        .collect(),
                ),
            ),
            ("duration_ms".into(), NativeValue::WideUInt(elapsed.as_millis())),
            ("saved_at".into(), Utc::now().to_rfc3339().as_str().into()),
        ]);
        let mut metadata = normalize(&metadata)?;
        if let serde_json::Value::Object(map) = &mut metadata {
            map.insert("report".into(), report.clone());
        }
        atomic_write_json(&dir.join("metadata.json"), &metadata)?;
        tracing::debug!(run_id = %run_id, stage = %stage, path = %dir.display(), "Saved stage artifacts");
        Ok(dir)
    }

    /// Write `run.json` (without the in-memory table).
    pub fn save_run(&self, run: &PipelineRun) -> Result<PathBuf, PipelineError> {
        let path = self.run_dir(run.run_id).join(RUN_FILE);
        atomic_write_json(&path, run)?;
        Ok(path)
    }

    pub fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, PipelineError> {
        Ok(load_json(&self.run_dir(run_id).join(RUN_FILE))?)
    }

    /// Run ids with a directory under the root.
    pub fn list_runs(&self) -> Result<Vec<Uuid>, PipelineError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove run directories whose last activity is older than `max_age`.
    ///
    /// Age comes from `run.json` when present, otherwise from the directory's
    /// modification time.
    pub fn cleanup(&self, max_age: Duration) -> Result<Vec<Uuid>, PipelineError> {
        self.cleanup_except(max_age, &HashSet::new())
    }

    /// Like [`cleanup`](Self::cleanup), but never touches the runs in `keep`.
    pub fn cleanup_except(
        &self,
        max_age: Duration,
        keep: &HashSet<Uuid>,
    ) -> Result<Vec<Uuid>, PipelineError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| PipelineError::config(format!("invalid max age: {e}")))?;
        let cutoff = Utc::now() - max_age;
        let mut removed = Vec::new();
        for run_id in self.list_runs()? {
            if keep.contains(&run_id) {
                tracing::debug!(run_id = %run_id, "Skipping artifacts of active run");
                continue;
            }
            let dir = self.run_dir(run_id);
            let last_activity = match self.load_run(run_id) {
                Ok(Some(run)) => run.last_activity(),
                _ => std::fs::metadata(&dir)?.modified()?.into(),
            };
            if last_activity < cutoff {
                std::fs::remove_dir_all(&dir)?;
                tracing::info!(run_id = %run_id, "Removed expired run artifacts");
                removed.push(run_id);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::data::table::Column;
    use crate::pipeline::run::RunStatus;
    use tempfile::TempDir;

    fn table() -> Table {
        Table::new(vec![Column::integer("x", vec![Some(1), None])]).unwrap()
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("a.json");
        atomic_write_json(&path, &serde_json::json!({"k": 1})).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        let loaded: Option<serde_json::Value> = load_json(&path).unwrap();
        assert_eq!(loaded.unwrap()["k"], 1);
    }

    #[test]
    fn test_load_json_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<serde_json::Value> = load_json(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_stage_layout() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let run_id = Uuid::new_v4();
        let stage_dir = store
            .save_stage(
                run_id,
                Stage::Preprocessing,
                &table(),
                &serde_json::json!({"errors": []}),
                Duration::from_millis(12),
            )
            .unwrap();
        assert_eq!(stage_dir, dir.path().join(run_id.to_string()).join("preprocessing"));

        let data: Vec<serde_json::Value> = load_json(&stage_dir.join("data.json")).unwrap().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[1]["x"], serde_json::Value::Null);

        let meta: serde_json::Value = load_json(&stage_dir.join("metadata.json")).unwrap().unwrap();
        assert_eq!(meta["rows"], 2);
        assert_eq!(meta["duration_ms"], 12);
        assert_eq!(meta["column_names"], serde_json::json!(["x"]));
        assert!(meta["report"]["errors"].is_array());
    }

    #[test]
    fn test_run_roundtrip_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());

        let mut old = PipelineRun::new(Uuid::new_v4(), PipelineConfig::default());
        old.start_time = Utc::now() - chrono::Duration::days(10);
        old.finish(RunStatus::Completed);
        old.end_time = Some(old.start_time);
        store.save_run(&old).unwrap();

        let mut fresh = PipelineRun::new(Uuid::new_v4(), PipelineConfig::default());
        fresh.finish(RunStatus::Completed);
        store.save_run(&fresh).unwrap();

        let loaded = store.load_run(fresh.run_id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(store.list_runs().unwrap().len(), 2);

        let removed = store.cleanup(Duration::from_secs(24 * 3600)).unwrap();
        assert_eq!(removed, vec![old.run_id]);
        assert!(!store.run_dir(old.run_id).exists());
        assert!(store.run_dir(fresh.run_id).exists());
    }

    #[test]
    fn test_cleanup_except_keeps_listed_runs() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let active = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let report = serde_json::json!({});
        for run_id in [active, stale] {
            store
                .save_stage(run_id, Stage::Preprocessing, &table(), &report, Duration::ZERO)
                .unwrap();
        }

        let keep = HashSet::from([active]);
        let removed = store.cleanup_except(Duration::ZERO, &keep).unwrap();
        assert_eq!(removed, vec![stale]);
        assert!(store.run_dir(active).join("preprocessing").join("data.json").exists());
        assert!(!store.run_dir(stale).exists());
    }

    #[test]
    fn test_list_runs_ignores_foreign_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("not-a-run")).unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.list_runs().unwrap().is_empty());
        assert!(ArtifactStore::new(dir.path().join("missing")).list_runs().unwrap().is_empty());
    }
}
