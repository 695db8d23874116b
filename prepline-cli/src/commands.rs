//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::RunsAction;
use anyhow::Context;
use prepline_core::data::source_for_path;
use prepline_core::validate::validate;
use prepline_core::{
    Analyzer, ArtifactStore, Orchestrator, PipelineConfig, RunStatus, Table, ValidationRules,
    load_config,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            input,
            artifacts,
            save_intermediate,
            output,
        } => handle_run(config_path, input, artifacts, save_intermediate, output).await,
        Commands::Validate { input, rules } => handle_validate(config_path, &input, rules.as_deref()).await,
        Commands::Analyze { input } => handle_analyze(config_path, &input).await,
        Commands::Runs { action } => handle_runs(action),
        Commands::Cleanup {
            max_age_hours,
            artifacts,
        } => handle_cleanup(max_age_hours, artifacts),
        Commands::Config { action } => handle_config(action, config_path),
    }
}

fn load(config_path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    load_config(config_path, None).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn artifact_root(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| crate::data_dir().join("runs"))
}

async fn load_table(input: &Path) -> anyhow::Result<Table> {
    let source = source_for_path(input)?;
    source
        .load(None)
        .await
        .with_context(|| format!("Failed to load {}", input.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_run(
    config_path: Option<&Path>,
    input: PathBuf,
    artifacts: Option<PathBuf>,
    save_intermediate: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = load(config_path)?;
    config.save_intermediate |= save_intermediate;

    let orchestrator = Orchestrator::new().with_artifact_root(artifact_root(artifacts));
    let run = orchestrator.run(input, config).await?;

    if let (Some(path), Some(table)) = (&output, &run.final_table) {
        std::fs::write(path, serde_json::to_string_pretty(&table.to_records())?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), rows = table.row_count(), "Wrote output table");
    }

    print_json(&run)?;
    if run.status == RunStatus::Failed {
        anyhow::bail!("Run {} failed: {}", run.run_id, run.errors.join("; "));
    }
    Ok(())
}

/// Parse a rules document, JSON when the extension is `.json`, TOML otherwise.
fn load_rules(path: &Path) -> anyhow::Result<ValidationRules> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let rules: ValidationRules = if is_json {
        serde_json::from_str(&text)?
    } else {
        toml::from_str(&text)?
    };
    rules.check()?;
    Ok(rules)
}

async fn handle_validate(
    config_path: Option<&Path>,
    input: &Path,
    rules_path: Option<&Path>,
) -> anyhow::Result<()> {
    let rules = match rules_path {
        Some(path) => load_rules(path)?,
        None => load(config_path)?.validation_config,
    };
    let table = load_table(input).await?;
    let report = validate(&table, &rules)?;
    print_json(&report)?;
    if !report.is_valid {
        anyhow::bail!("{} validation violation(s)", report.violations.len());
    }
    Ok(())
}

async fn handle_analyze(config_path: Option<&Path>, input: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let table = load_table(input).await?;
    let analyzer = Analyzer::new(config.analysis_config);
    let report = tokio::task::spawn_blocking(move || analyzer.analyze(&table)).await??;
    print_json(&report)
}

fn handle_runs(action: RunsAction) -> anyhow::Result<()> {
    match action {
        RunsAction::List { artifacts } => {
            let store = ArtifactStore::new(artifact_root(artifacts));
            let ids = store.list_runs()?;
            if ids.is_empty() {
                eprintln!("No runs found in: {}", store.root().display());
            }
            print_json(&ids)
        }
        RunsAction::Show { run_id, artifacts } => {
            let run_id = uuid::Uuid::parse_str(&run_id)
                .map_err(|e| anyhow::anyhow!("Invalid run ID '{}': {}", run_id, e))?;
            let store = ArtifactStore::new(artifact_root(artifacts));
            match store.load_run(run_id)? {
                Some(run) => print_json(&run),
                None => anyhow::bail!("Run not found: {}", run_id),
            }
        }
    }
}

fn handle_cleanup(max_age_hours: u64, artifacts: Option<PathBuf>) -> anyhow::Result<()> {
    let store = ArtifactStore::new(artifact_root(artifacts));
    let max_age = Duration::from_secs(max_age_hours.saturating_mul(3600));
    let removed = store.cleanup(max_age)?;
    print_json(&serde_json::json!({
        "root": store.root(),
        "removed": removed,
    }))
}

fn handle_config(action: ConfigAction, config_path: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load(config_path)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigAction::Init { path } => {
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            std::fs::write(&path, PipelineConfig::default().to_toml()?)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_rules_json_and_toml() {
        let dir = TempDir::new().unwrap();
        let json = dir.path().join("rules.json");
        std::fs::write(&json, r#"{"required_columns": ["id"], "max_missing_ratio": 0.2}"#).unwrap();
        let rules = load_rules(&json).unwrap();
        assert!(rules.required_columns.contains("id"));
        assert_eq!(rules.max_missing_ratio, 0.2);

        let toml_path = dir.path().join("rules.toml");
        std::fs::write(&toml_path, "unique_columns = [\"id\"]\n").unwrap();
        let rules = load_rules(&toml_path).unwrap();
        assert!(rules.unique_columns.contains("id"));
        assert_eq!(rules.max_missing_ratio, 0.5);
    }

    #[test]
    fn test_load_rules_rejects_bad_ratio() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(&path, "max_missing_ratio = 1.5\n").unwrap();
        assert!(load_rules(&path).is_err());
    }

    #[test]
    fn test_artifact_root_prefers_explicit() {
        assert_eq!(
            artifact_root(Some(PathBuf::from("/tmp/artifacts"))),
            PathBuf::from("/tmp/artifacts")
        );
        assert!(artifact_root(None).ends_with("runs"));
    }

    #[tokio::test]
    async fn test_run_writes_output_table() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("data.csv");
        std::fs::write(&input, "a,b\n1,2\n3,\n5,6\n").unwrap();
        let output = dir.path().join("out.json");

        handle_run(
            None,
            input,
            Some(dir.path().join("runs")),
            true,
            Some(output.clone()),
        )
        .await
        .unwrap();

        let records: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(records.len(), 3);
        let store = ArtifactStore::new(dir.path().join("runs"));
        assert_eq!(store.list_runs().unwrap().len(), 1);
    }
}
