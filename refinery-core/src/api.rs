//! The `Refinery` facade: one entry point wiring the registry, engines,
//! lineage tracker, and recipe store over a shared Dataset Access.

use crate::config::RefineryConfig;
use crate::data::access::DatasetAccess;
use crate::data::fs::FsDatasetAccess;
use crate::data::memory::InMemoryDatasetAccess;
use crate::data::stats::{BasicStats, StatsProvider};
use crate::engine::apply::{ApplyEngine, ApplyOutcome, ApplyProgress, ApplyRequest};
use crate::engine::preview::{PreviewCache, PreviewEngine, PreviewResult, PreviewSession};
use crate::engine::validate::{ValidationReport, validate};
use crate::error::Result;
use crate::export::{self, ExportTarget};
use crate::lineage::LineageTracker;
use crate::pipeline::{Pipeline, PipelineHistory};
use crate::recipes::SqliteRecipeStore;
use crate::transform::registry::TransformationRegistry;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub struct Refinery {
    config: RefineryConfig,
    registry: Arc<TransformationRegistry>,
    access: Arc<dyn DatasetAccess>,
    preview: Arc<PreviewEngine>,
    apply: ApplyEngine,
    lineage: LineageTracker,
    recipes: SqliteRecipeStore,
}

impl Refinery {
    /// Wire every component with the built-in transformations and
    /// [`BasicStats`].
    pub fn new(
        config: RefineryConfig,
        access: Arc<dyn DatasetAccess>,
        recipes: SqliteRecipeStore,
    ) -> Self {
        Self::with_parts(
            config,
            Arc::new(TransformationRegistry::with_builtins()),
            access,
            Arc::new(BasicStats),
            recipes,
        )
    }

    pub fn with_parts(
        config: RefineryConfig,
        registry: Arc<TransformationRegistry>,
        access: Arc<dyn DatasetAccess>,
        stats: Arc<dyn StatsProvider>,
        recipes: SqliteRecipeStore,
    ) -> Self {
        let mut preview = PreviewEngine::new(
            Arc::clone(&registry),
            Arc::clone(&access),
            stats,
            config.preview.clone(),
        );
        if let Some(cache) = PreviewCache::from_config(&config.preview) {
            preview = preview.with_cache(Arc::new(cache));
        }
        let apply = ApplyEngine::new(
            Arc::clone(&registry),
            Arc::clone(&access),
            config.apply.clone(),
        );
        Self {
            lineage: LineageTracker::new(Arc::clone(&access)),
            preview: Arc::new(preview),
            apply,
            registry,
            access,
            recipes,
            config,
        }
    }

    /// File-backed datasets and a SQLite recipe database under the
    /// configured data directory. The typed access is returned for imports.
    pub fn open(config: RefineryConfig, workspace: &Path) -> Result<(Self, Arc<FsDatasetAccess>)> {
        let data_dir = config.storage.resolve_data_dir(workspace);
        let access = Arc::new(FsDatasetAccess::new(data_dir.join("datasets")));
        let recipes = SqliteRecipeStore::open(&data_dir.join("recipes.db"))?;
        info!(data_dir = %data_dir.display(), "Opened refinery");
        Ok((Self::new(config, access.clone(), recipes), access))
    }

    /// Everything in memory; nothing survives the process.
    pub fn in_memory(config: RefineryConfig) -> Result<(Self, Arc<InMemoryDatasetAccess>)> {
        let access = Arc::new(InMemoryDatasetAccess::new());
        let refinery = Self::new(config, access.clone(), SqliteRecipeStore::in_memory()?);
        Ok((refinery, access))
    }

    /// Check `pipeline` against its source version's schema.
    pub async fn validate(&self, pipeline: &Pipeline) -> Result<ValidationReport> {
        let version = self.access.get_version(&pipeline.source_version).await?;
        validate(&self.registry, pipeline, &version.schema)
    }

    pub async fn preview(
        &self,
        pipeline: &Pipeline,
        preview_rows: Option<usize>,
    ) -> Result<Arc<PreviewResult>> {
        self.preview.preview(pipeline, preview_rows).await
    }

    /// A session for one editor; superseded previews come back as `None`.
    pub fn preview_session(&self) -> PreviewSession {
        PreviewSession::new(Arc::clone(&self.preview))
    }

    pub async fn apply(&self, pipeline: &Pipeline, requested_by: &str) -> Result<ApplyOutcome> {
        self.apply.apply(pipeline, requested_by).await
    }

    pub async fn apply_with_progress(
        &self,
        request: ApplyRequest,
        progress: &watch::Sender<ApplyProgress>,
    ) -> Result<ApplyOutcome> {
        self.apply.execute(request, Some(progress)).await
    }

    /// Apply a stored recipe to `target_version`.
    pub async fn apply_recipe(
        &self,
        recipe_id: &str,
        target_version: &str,
        caller: &str,
    ) -> Result<ApplyOutcome> {
        self.recipes
            .apply(&self.apply, recipe_id, target_version, caller)
            .await
    }

    pub fn export_code(&self, pipeline: &Pipeline, target: ExportTarget) -> String {
        export::export(pipeline, target)
    }

    pub fn import_script(&self, text: &str, source_version: &str) -> Result<Pipeline> {
        export::import_script(text, source_version)
    }

    /// Start an edit history for `pipeline` with the configured depth.
    pub fn history(&self, pipeline: Pipeline) -> PipelineHistory {
        PipelineHistory::new(pipeline, self.config.history.max_depth)
    }

    pub fn recipes(&self) -> &SqliteRecipeStore {
        &self.recipes
    }

    pub fn lineage(&self) -> &LineageTracker {
        &self.lineage
    }

    pub fn registry(&self) -> &TransformationRegistry {
        &self.registry
    }

    pub fn datasets(&self) -> &Arc<dyn DatasetAccess> {
        &self.access
    }

    pub fn config(&self) -> &RefineryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batch::DataBatch;
    use crate::recipes::NewRecipe;
    use serde_json::json;

    #[tokio::test]
    async fn test_facade_end_to_end() {
        let (refinery, access) = Refinery::in_memory(RefineryConfig::default()).unwrap();
        let batch = DataBatch::from_records(&[
            json!({"age": 10}),
            json!({"age": null}),
            json!({"age": 20}),
        ])
        .unwrap();
        let root = access.import("ages", batch).await.unwrap();
        let pipeline = Pipeline::new(&root).with_step("fill_mean", json!({"columns": ["age"]}));

        refinery.validate(&pipeline).await.unwrap();
        let preview = refinery.preview(&pipeline, None).await.unwrap();
        assert_eq!(preview.after.rows[1][0], json!(15.0));

        let outcome = refinery.apply(&pipeline, "ann").await.unwrap();
        let ancestry = refinery
            .lineage()
            .ancestry(&outcome.new_version_id)
            .await
            .unwrap();
        assert_eq!(ancestry.len(), 2);

        let recipe = refinery
            .recipes()
            .create(NewRecipe::new("impute", "ann", pipeline.steps.clone()))
            .await
            .unwrap();
        let again = refinery.apply_recipe(&recipe, &root, "ann").await.unwrap();
        assert_ne!(again.new_version_id, outcome.new_version_id);
        assert_eq!(refinery.lineage().children(&root).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_open_uses_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RefineryConfig::default();
        config.storage.data_dir = Some(dir.path().join("data"));
        let (refinery, access) = Refinery::open(config, dir.path()).unwrap();
        assert!(refinery.datasets().list_versions().await.unwrap().is_empty());
        assert!(access.root().starts_with(dir.path().join("data")));
        assert!(dir.path().join("data").join("recipes.db").exists());
    }
}
