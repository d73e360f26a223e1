//! Command handlers for the CLI subcommands.

use crate::{
    Commands, ConfigAction, DatasetAction, RecipeAction, TransformsAction,
};
use anyhow::Context;
use refinery_core::config::{RefineryConfig, load_config};
use refinery_core::data::FsDatasetAccess;
use refinery_core::export::{ExportTarget, SCRIPT_HEADER};
use refinery_core::recipes::{NewRecipe, RecipeFilter, RecipeUpdate, Visibility};
use refinery_core::{
    ApplyProgress, ApplyRequest, DataBatch, Pipeline, Refinery, TransformationStep,
};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace).await,
        Commands::Transforms { action } => handle_transforms(action, workspace).await,
        Commands::Dataset { action } => handle_dataset(action, workspace).await,
        Commands::Recipe { action } => handle_recipe(action, workspace).await,
        Commands::Validate { pipeline, source } => {
            let (refinery, _) = open(workspace)?;
            let pipeline = load_pipeline(&pipeline, source.as_deref())?;
            match refinery.validate(&pipeline).await {
                Ok(report) => {
                    println!(
                        "Pipeline is valid: {} step(s), output columns: {}",
                        report.step_schemas.len(),
                        report.output_schema.names().join(", ")
                    );
                    Ok(())
                }
                Err(e) if !e.violations().is_empty() => {
                    for v in e.violations() {
                        println!("  {v}");
                    }
                    anyhow::bail!("pipeline failed validation with {} problem(s)", e.violations().len())
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::Preview {
            pipeline,
            rows,
            source,
        } => {
            let (refinery, _) = open(workspace)?;
            let pipeline = load_pipeline(&pipeline, source.as_deref())?;
            let result = refinery.preview(&pipeline, rows).await?;
            println!(
                "Preview of {} row(s): {} rows after, {:+} rows",
                result.sample_size,
                result.after.row_count(),
                result.row_delta
            );
            if !result.columns_added.is_empty() {
                println!("Columns added: {}", result.columns_added.join(", "));
            }
            if !result.columns_removed.is_empty() {
                println!("Columns removed: {}", result.columns_removed.join(", "));
            }
            for warning in &result.warnings {
                println!("warning: {warning}");
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&result.after.to_records())?
            );
            Ok(())
        }
        Commands::Apply {
            pipeline,
            user,
            name,
            source,
        } => {
            let (refinery, _) = open(workspace)?;
            let pipeline = load_pipeline(&pipeline, source.as_deref())?;
            let mut request = ApplyRequest::new(pipeline, &user);
            if let Some(name) = name {
                request = request.named(name);
            }

            let (tx, mut rx) = watch::channel(ApplyProgress::default());
            let reporter = tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let progress = rx.borrow_and_update().clone();
                    debug!(
                        phase = ?progress.phase,
                        chunks = progress.chunks_written,
                        rows = progress.rows_written,
                        "Apply progress"
                    );
                }
            });
            let outcome = refinery.apply_with_progress(request, &tx).await;
            drop(tx);
            let _ = reporter.await;

            let outcome = outcome?;
            println!("Created dataset version {}", outcome.new_version_id);
            println!("{}", serde_json::to_string_pretty(&outcome.diagnostics)?);
            Ok(())
        }
        Commands::Export {
            pipeline,
            target,
            output,
            source,
        } => {
            let (refinery, _) = open(workspace)?;
            let pipeline = load_pipeline(&pipeline, source.as_deref())?;
            let code = refinery.export_code(&pipeline, target);
            match output {
                Some(path) => {
                    std::fs::write(&path, &code)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported {} step(s) to {}", pipeline.len(), path.display());
                }
                None => print!("{code}"),
            }
            Ok(())
        }
    }
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".refinery");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&RefineryConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn handle_transforms(action: TransformsAction, workspace: &Path) -> anyhow::Result<()> {
    let (refinery, _) = open(workspace)?;
    match action {
        TransformsAction::List => {
            let mut current = None;
            for info in refinery.registry().list() {
                if current != Some(info.category) {
                    println!("{:?}:", info.category);
                    current = Some(info.category);
                }
                println!("  {:<22} {}", info.id, info.description);
            }
            Ok(())
        }
        TransformsAction::Show { id } => {
            let info = refinery.registry().info(&id)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

async fn handle_dataset(action: DatasetAction, workspace: &Path) -> anyhow::Result<()> {
    let (refinery, access) = open(workspace)?;
    match action {
        DatasetAction::Import { file, name } => {
            let batch = read_dataset(&file)?;
            let rows = batch.row_count();
            let id = access.import(&name, batch).await?;
            println!("Imported {rows} row(s) as dataset version {id}");
            Ok(())
        }
        DatasetAction::List => {
            let versions = refinery.datasets().list_versions().await?;
            if versions.is_empty() {
                println!("No dataset versions. Import one with `refinery dataset import`.");
            }
            for v in versions {
                let parent = v.parent_id.as_deref().unwrap_or("-");
                println!("{}  {:<20} rows={:<8} parent={}", v.id, v.name, v.row_count, parent);
            }
            Ok(())
        }
        DatasetAction::Show { id, head } => {
            let version = refinery.datasets().get_version(&id).await?;
            println!("{}", serde_json::to_string_pretty(&version)?);
            if let Some(n) = head {
                let (batch, _) = refinery.datasets().get_sample(&id, n).await?;
                println!("{}", serde_json::to_string_pretty(&batch.to_records())?);
            }
            Ok(())
        }
        DatasetAction::Lineage { id } => {
            let lineage = refinery.lineage();
            for (depth, entry) in lineage.ancestry(&id).await?.iter().enumerate() {
                let indent = "  ".repeat(depth);
                match &entry.edge {
                    Some(edge) => println!(
                        "{indent}{} ({}) <- {} step(s) by {}",
                        entry.version.id,
                        entry.version.name,
                        edge.pipeline.steps.len(),
                        edge.requested_by
                    ),
                    None => println!("{indent}{} ({}) [root]", entry.version.id, entry.version.name),
                }
            }
            let children = lineage.children(&id).await?;
            if !children.is_empty() {
                println!("Children:");
                for child in children {
                    println!("  {} ({})", child.id, child.name);
                }
            }
            Ok(())
        }
        DatasetAction::Verify => {
            let report = refinery.lineage().verify_tree().await?;
            println!(
                "{} version(s), {} root(s)",
                report.versions,
                report.roots.len()
            );
            if report.is_valid() {
                println!("Lineage is intact.");
                Ok(())
            } else {
                for problem in &report.problems {
                    println!("  {problem}");
                }
                anyhow::bail!("lineage has {} problem(s)", report.problems.len())
            }
        }
    }
}

async fn handle_recipe(action: RecipeAction, workspace: &Path) -> anyhow::Result<()> {
    let (refinery, _) = open(workspace)?;
    let store = refinery.recipes();
    match action {
        RecipeAction::Create {
            name,
            user,
            pipeline,
            from_version,
            description,
            visibility,
            tags,
        } => {
            let id = match (pipeline, from_version) {
                (Some(path), _) => {
                    let steps = load_pipeline(&path, Some("-"))?.steps;
                    let mut recipe = NewRecipe::new(&name, &user, steps)
                        .with_description(description)
                        .with_tags(tags);
                    recipe.visibility = visibility;
                    store.create(recipe).await?
                }
                (None, Some(version)) => {
                    let id = store
                        .create_from_version(refinery.datasets().as_ref(), &version, &user, &name)
                        .await?;
                    if visibility != Visibility::Private || !tags.is_empty() || !description.is_empty() {
                        let update = RecipeUpdate {
                            description: (!description.is_empty()).then_some(description),
                            visibility: Some(visibility),
                            tags: (!tags.is_empty()).then_some(tags),
                            ..RecipeUpdate::default()
                        };
                        store.update_metadata(&id, &user, update).await?;
                    }
                    id
                }
                (None, None) => anyhow::bail!("either --pipeline or --from-version is required"),
            };
            println!("Created recipe {id}");
            Ok(())
        }
        RecipeAction::List {
            owner,
            public,
            tags,
            page,
            per_page,
        } => {
            let filter = RecipeFilter {
                owner,
                public_only: public,
                tags,
            };
            let result = store.list(&filter, page, per_page).await?;
            println!(
                "Page {} ({} per page), {} recipe(s) total",
                result.page, result.per_page, result.total
            );
            for r in &result.items {
                println!(
                    "{}  {:<24} owner={:<12} {:<7} used={} rating={:.1} ({})",
                    r.id,
                    r.name,
                    r.owner,
                    r.visibility,
                    r.usage_count,
                    r.rating.average,
                    r.rating.count
                );
            }
            Ok(())
        }
        RecipeAction::Show { id } => {
            let recipe = store.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&recipe)?);
            Ok(())
        }
        RecipeAction::Apply { id, version, user } => {
            let outcome = refinery.apply_recipe(&id, &version, &user).await?;
            println!("Created dataset version {}", outcome.new_version_id);
            println!("{}", serde_json::to_string_pretty(&outcome.diagnostics)?);
            Ok(())
        }
        RecipeAction::Revise { id, pipeline, user } => {
            let steps = load_pipeline(&pipeline, Some("-"))?.steps;
            let new_id = store.revise_steps(&id, &user, steps).await?;
            println!("Created recipe {new_id} (derived from {id})");
            Ok(())
        }
        RecipeAction::Update {
            id,
            user,
            name,
            description,
            visibility,
            tags,
        } => {
            let update = RecipeUpdate {
                name,
                description,
                visibility,
                tags,
            };
            let recipe = store.update_metadata(&id, &user, update).await?;
            println!("{}", serde_json::to_string_pretty(&recipe)?);
            Ok(())
        }
        RecipeAction::Delete { id, user } => {
            store.delete(&id, &user).await?;
            println!("Deleted recipe {id}");
            Ok(())
        }
        RecipeAction::Rate { id, user, score } => {
            let rating = store.rate(&id, &user, score).await?;
            println!(
                "Recipe {id} is rated {:.1} from {} rating(s)",
                rating.average, rating.count
            );
            Ok(())
        }
    }
}

fn open(workspace: &Path) -> anyhow::Result<(Refinery, Arc<FsDatasetAccess>)> {
    let config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    Ok(Refinery::open(config, workspace)?)
}

/// On-disk pipeline layout. `source_version` may be left out and supplied
/// on the command line instead.
#[derive(Debug, Deserialize)]
struct PipelineFile {
    #[serde(default)]
    source_version: Option<String>,
    #[serde(default)]
    steps: Vec<TransformationStep>,
}

/// Read a pipeline from a JSON file or a refinery script. `source`
/// overrides the file's source version and is required for scripts.
fn load_pipeline(path: &Path, source: Option<&str>) -> anyhow::Result<Pipeline> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline {}", path.display()))?;
    parse_pipeline(&text, source).with_context(|| format!("loading pipeline {}", path.display()))
}

fn parse_pipeline(text: &str, source: Option<&str>) -> anyhow::Result<Pipeline> {
    if text.trim_start().starts_with(SCRIPT_HEADER) {
        let source = source.context("--source is required for script pipelines")?;
        return Ok(refinery_core::import_script(text, source)?);
    }
    let file: PipelineFile = serde_json::from_str(text)?;
    let source = source
        .map(str::to_string)
        .or(file.source_version)
        .context("pipeline has no source_version; pass --source")?;
    Ok(Pipeline::from_steps(source, file.steps).normalized())
}

/// Read a JSON array of objects, or JSON Lines, into a batch.
fn read_dataset(path: &Path) -> anyhow::Result<DataBatch> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading dataset {}", path.display()))?;
    parse_records(&text).with_context(|| format!("parsing dataset {}", path.display()))
}

fn parse_records(text: &str) -> anyhow::Result<DataBatch> {
    let records: Vec<serde_json::Value> = if text.trim_start().starts_with('[') {
        serde_json::from_str(text)?
    } else {
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).with_context(|| format!("line {}", i + 1))
            })
            .collect::<anyhow::Result<_>>()?
    };
    Ok(DataBatch::from_records(&records)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use refinery_core::export::export;
    use serde_json::json;

    #[test]
    fn test_parse_json_pipeline() {
        let text = r#"{
            "source_version": "v1",
            "steps": [
                {"type": "fill_mean", "params": {"columns": ["age"]}, "order": 1},
                {"type": "trim_whitespace", "order": 0}
            ]
        }"#;
        let pipeline = parse_pipeline(text, None).unwrap();
        assert_eq!(pipeline.source_version, "v1");
        let types: Vec<&str> = pipeline.steps.iter().map(|s| s.type_id.as_str()).collect();
        assert_eq!(types, vec!["trim_whitespace", "fill_mean"]);
        assert!(pipeline.is_well_ordered());
    }

    #[test]
    fn test_source_flag_overrides_file() {
        let text = r#"{"source_version": "v1", "steps": []}"#;
        assert_eq!(parse_pipeline(text, Some("v2")).unwrap().source_version, "v2");
        assert!(parse_pipeline(r#"{"steps": []}"#, None).is_err());
    }

    #[test]
    fn test_parse_script_pipeline() {
        let pipeline = Pipeline::new("v1").with_step("create_bins", json!({"column": "score", "bins": 3}));
        let script = export(&pipeline, ExportTarget::Script);
        assert!(parse_pipeline(&script, None).is_err());
        let loaded = parse_pipeline(&script, Some("v9")).unwrap();
        assert_eq!(loaded.source_version, "v9");
        assert_eq!(loaded.steps[0].params, pipeline.steps[0].params);
    }

    #[test]
    fn test_parse_records_array_and_lines() {
        let array = parse_records(r#"[{"a": 1}, {"a": 2}]"#).unwrap();
        let lines = parse_records("{\"a\": 1}\n\n{\"a\": 2}\n").unwrap();
        assert_eq!(array, lines);
        assert_eq!(array.row_count(), 2);
        assert!(parse_records("{\"a\": 1}\nnot json\n").is_err());
    }

    #[test]
    fn test_load_pipeline_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"source_version": "v1", "steps": [{"type": "drop_missing"}]}"#)
            .unwrap();
        let pipeline = load_pipeline(&path, None).unwrap();
        assert_eq!(pipeline.len(), 1);
        assert!(load_pipeline(&dir.path().join("missing.json"), None).is_err());
    }
}
