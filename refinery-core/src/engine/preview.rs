//! Preview Engine: run a pipeline over a bounded sample without touching
//! persisted state.

use crate::config::PreviewConfig;
use crate::data::access::DatasetAccess;
use crate::data::batch::DataBatch;
use crate::data::schema::SchemaDefinition;
use crate::data::stats::{DatasetStats, StatsProvider};
use crate::engine::executor::run_local;
use crate::error::{RefineryError, Result};
use crate::pipeline::Pipeline;
use crate::transform::kernel::{ExecMode, StepDiagnostics};
use crate::transform::registry::TransformationRegistry;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The effect of a pipeline on a sample. Contains no timestamps, so equal
/// inputs give equal results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewResult {
    pub source_version: String,
    pub pipeline_hash: String,
    /// Rows actually sampled; fewer than requested for small datasets.
    pub sample_size: usize,
    pub before: DataBatch,
    pub after: DataBatch,
    pub before_stats: DatasetStats,
    pub after_stats: DatasetStats,
    pub output_schema: SchemaDefinition,
    pub row_delta: i64,
    pub columns_added: Vec<String>,
    pub columns_removed: Vec<String>,
    pub steps: Vec<StepDiagnostics>,
    /// Warnings of every step, prefixed with the step they came from.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PreviewKey {
    pipeline_hash: String,
    source_version: String,
    sample_size: usize,
}

/// Bounded cache of preview results with a time-to-live.
pub struct PreviewCache {
    entries: Mutex<LruCache<PreviewKey, (Instant, Arc<PreviewResult>)>>,
    ttl: Duration,
}

impl PreviewCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// A cache sized from configuration; `None` when caching is disabled.
    pub fn from_config(config: &PreviewConfig) -> Option<Self> {
        NonZeroUsize::new(config.cache_capacity)
            .map(|cap| Self::new(cap, Duration::from_secs(config.cache_ttl_secs)))
    }

    fn get(&self, key: &PreviewKey) -> Option<Arc<PreviewResult>> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((stored, result)) if stored.elapsed() < self.ttl => Some(Arc::clone(result)),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: PreviewKey, result: Arc<PreviewResult>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key, (Instant::now(), result));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Executes pipelines over samples.
pub struct PreviewEngine {
    registry: Arc<TransformationRegistry>,
    access: Arc<dyn DatasetAccess>,
    stats: Arc<dyn StatsProvider>,
    config: PreviewConfig,
    cache: Option<Arc<PreviewCache>>,
}

impl PreviewEngine {
    pub fn new(
        registry: Arc<TransformationRegistry>,
        access: Arc<dyn DatasetAccess>,
        stats: Arc<dyn StatsProvider>,
        config: PreviewConfig,
    ) -> Self {
        Self {
            registry,
            access,
            stats,
            config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<PreviewCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The sample size actually used for a request.
    pub fn sample_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.default_rows)
            .clamp(1, self.config.max_rows.max(1))
    }

    /// Preview `pipeline` on the first rows of its source version.
    pub async fn preview(
        &self,
        pipeline: &Pipeline,
        preview_rows: Option<usize>,
    ) -> Result<Arc<PreviewResult>> {
        let sample_size = self.sample_size(preview_rows);
        let key = PreviewKey {
            pipeline_hash: pipeline.content_hash(),
            source_version: pipeline.source_version.clone(),
            sample_size,
        };
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!(pipeline = %pipeline.id, "Preview served from cache");
            return Ok(bind_step_ids(hit, pipeline));
        }

        let budget = Duration::from_millis(self.config.timeout_ms);
        let result = tokio::time::timeout(budget, self.compute(pipeline, sample_size))
            .await
            .map_err(|_| {
                RefineryError::execution(format!(
                    "preview timed out after {} ms",
                    self.config.timeout_ms
                ))
            })??;
        let result = Arc::new(result);
        if let Some(cache) = &self.cache {
            cache.put(key, Arc::clone(&result));
        }
        Ok(result)
    }

    async fn compute(&self, pipeline: &Pipeline, sample_size: usize) -> Result<PreviewResult> {
        let (before, schema) = self
            .access
            .get_sample(&pipeline.source_version, sample_size)
            .await?;
        let run = run_local(
            &self.registry,
            pipeline,
            before.clone(),
            &schema,
            ExecMode::Lenient,
        )
        .await?;

        let before_names = schema.names();
        let after_names = run.schema.names();
        let warnings = run
            .steps
            .iter()
            .flat_map(|s| {
                s.warnings
                    .iter()
                    .map(move |w| format!("step {} ({}): {w}", s.order, s.step_type))
            })
            .collect();

        debug!(
            pipeline = %pipeline.id,
            rows = before.row_count(),
            steps = pipeline.len(),
            "Computed preview"
        );

        Ok(PreviewResult {
            source_version: pipeline.source_version.clone(),
            pipeline_hash: pipeline.content_hash(),
            sample_size: before.row_count(),
            before_stats: self.stats.compute_stats(&before, &schema),
            after_stats: self.stats.compute_stats(&run.output, &run.schema),
            row_delta: run.output.row_count() as i64 - before.row_count() as i64,
            columns_added: after_names
                .iter()
                .filter(|c| !before_names.contains(c))
                .cloned()
                .collect(),
            columns_removed: before_names
                .iter()
                .filter(|c| !after_names.contains(c))
                .cloned()
                .collect(),
            before,
            after: run.output,
            output_schema: run.schema,
            steps: run.steps,
            warnings,
        })
    }
}

/// The cache is keyed by content, so a hit may come from a pipeline whose
/// steps carry other ids. Diagnostics must name the caller's steps.
fn bind_step_ids(hit: Arc<PreviewResult>, pipeline: &Pipeline) -> Arc<PreviewResult> {
    let matches = hit
        .steps
        .iter()
        .zip(&pipeline.steps)
        .all(|(d, s)| d.step_id == s.id);
    if matches {
        return hit;
    }
    let mut result = (*hit).clone();
    for (diagnostics, step) in result.steps.iter_mut().zip(&pipeline.steps) {
        diagnostics.step_id = step.id.clone();
    }
    Arc::new(result)
}

/// Tracks the latest preview request of one editing session. Results of
/// requests superseded by a newer one are discarded.
pub struct PreviewSession {
    engine: Arc<PreviewEngine>,
    latest: AtomicU64,
}

impl PreviewSession {
    pub fn new(engine: Arc<PreviewEngine>) -> Self {
        Self {
            engine,
            latest: AtomicU64::new(0),
        }
    }

    /// Run a preview. Returns `Ok(None)` when a newer request was started
    /// while this one ran.
    pub async fn request(
        &self,
        pipeline: &Pipeline,
        preview_rows: Option<usize>,
    ) -> Result<Option<Arc<PreviewResult>>> {
        let seq = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.engine.preview(pipeline, preview_rows).await;
        if self.latest.load(Ordering::SeqCst) != seq {
            warn!(seq, "Discarding superseded preview");
            return Ok(None);
        }
        result.map(Some)
    }

    /// Sequence number of the most recent request.
    pub fn current(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::InMemoryDatasetAccess;
    use crate::data::stats::BasicStats;
    use crate::error::ErrorKind;
    use serde_json::json;

    async fn setup(config: PreviewConfig) -> (Arc<InMemoryDatasetAccess>, PreviewEngine, String) {
        let access = Arc::new(InMemoryDatasetAccess::new());
        let records: Vec<_> = (0..250)
            .map(|i| {
                let score = if i % 5 == 0 { json!(null) } else { json!(i) };
                json!({"id": i, "name": format!("  user{i} "), "score": score})
            })
            .collect();
        let id = access
            .import("users", DataBatch::from_records(&records).unwrap())
            .await
            .unwrap();
        let engine = PreviewEngine::new(
            Arc::new(TransformationRegistry::with_builtins()),
            access.clone(),
            Arc::new(BasicStats),
            config,
        );
        (access, engine, id)
    }

    #[tokio::test]
    async fn test_default_and_capped_sample_sizes() {
        let config = PreviewConfig {
            max_rows: 120,
            ..PreviewConfig::default()
        };
        let (_, engine, id) = setup(config).await;
        let pipeline = Pipeline::new(&id).with_step("trim_whitespace", json!({}));
        let result = engine.preview(&pipeline, None).await.unwrap();
        assert_eq!(result.before.row_count(), 100);
        assert_eq!(result.after.rows[0][1], json!("user0"));

        let result = engine.preview(&pipeline, Some(5000)).await.unwrap();
        assert_eq!(result.sample_size, 120);
        assert_eq!(result.before.row_count(), 120);
    }

    #[tokio::test]
    async fn test_preview_is_deterministic_and_read_only() {
        let (access, engine, id) = setup(PreviewConfig::default()).await;
        let pipeline = Pipeline::new(&id)
            .with_step("fill_median", json!({"columns": ["score"]}))
            .with_step("create_bins", json!({"column": "score", "bins": 3}));
        let a = engine.preview(&pipeline, Some(50)).await.unwrap();
        let b = engine.preview(&pipeline, Some(50)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.columns_added, vec!["score_bin"]);
        assert_eq!(access.list_versions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lenient_mode_reports_warnings() {
        let access = Arc::new(InMemoryDatasetAccess::new());
        let batch = DataBatch::from_records(&[
            json!({"v": 1}),
            json!({"v": "oops"}),
            json!({"v": 3}),
        ])
        .unwrap();
        let schema = SchemaDefinition::new(vec![crate::data::schema::ColumnSchema::new(
            "v",
            crate::data::schema::ColumnType::Integer,
            false,
        )]);
        let id = access.import_with_schema("mixed", batch, schema).await.unwrap();
        let engine = PreviewEngine::new(
            Arc::new(TransformationRegistry::with_builtins()),
            access,
            Arc::new(BasicStats),
            PreviewConfig::default(),
        );
        let pipeline = Pipeline::new(&id).with_step("fill_mean", json!({"columns": ["v"]}));
        let result = engine.preview(&pipeline, None).await.unwrap();
        assert_eq!(result.steps[0].cell_errors, 1);
        assert_eq!(result.after.rows[1][0], json!("oops"));
        assert!(result.warnings[0].starts_with("step 0 (fill_mean): "));
    }

    #[tokio::test]
    async fn test_validation_error_surfaces() {
        let (_, engine, id) = setup(PreviewConfig::default()).await;
        let pipeline = Pipeline::new(&id).with_step("fill_mean", json!({"columns": ["name"]}));
        let err = engine.preview(&pipeline, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_cache_hit_returns_same_result() {
        let (_, engine, id) = setup(PreviewConfig::default()).await;
        let cache = Arc::new(PreviewCache::new(
            NonZeroUsize::new(4).unwrap(),
            Duration::from_secs(60),
        ));
        let engine = engine.with_cache(cache.clone());
        let pipeline = Pipeline::new(&id).with_step("trim_whitespace", json!({}));
        let first = engine.preview(&pipeline, Some(10)).await.unwrap();
        let second = engine.preview(&pipeline, Some(10)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        engine.preview(&pipeline, Some(11)).await.unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_reports_caller_step_ids() {
        let (_, engine, id) = setup(PreviewConfig::default()).await;
        let cache = Arc::new(PreviewCache::new(
            NonZeroUsize::new(4).unwrap(),
            Duration::from_secs(60),
        ));
        let engine = engine.with_cache(cache.clone());
        let original = Pipeline::new(&id)
            .with_step("trim_whitespace", json!({}))
            .with_step("fill_mean", json!({"columns": ["score"]}));
        let rebuilt = Pipeline::new(&id)
            .with_step("trim_whitespace", json!({}))
            .with_step("fill_mean", json!({"columns": ["score"]}));
        assert_eq!(original.content_hash(), rebuilt.content_hash());
        assert_ne!(original.steps[0].id, rebuilt.steps[0].id);

        let first = engine.preview(&original, Some(10)).await.unwrap();
        let second = engine.preview(&rebuilt, Some(10)).await.unwrap();
        assert_eq!(cache.len(), 1);
        let ids: Vec<_> = second.steps.iter().map(|s| s.step_id.clone()).collect();
        let expected: Vec<_> = rebuilt.steps.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, expected);
        assert_eq!(first.steps[0].step_id, original.steps[0].id);
        assert_eq!(first.after, second.after);
    }

    /// Delays sampling so concurrent requests overlap.
    struct SlowAccess(Arc<InMemoryDatasetAccess>);

    #[async_trait::async_trait]
    impl DatasetAccess for SlowAccess {
        async fn get_version(&self, id: &str) -> Result<crate::data::access::DatasetVersion> {
            self.0.get_version(id).await
        }
        async fn get_sample(&self, id: &str, limit: usize) -> Result<(DataBatch, SchemaDefinition)> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.get_sample(id, limit).await
        }
        async fn get_rows_streaming(
            &self,
            id: &str,
            chunk_size: usize,
        ) -> Result<crate::data::access::ChunkStream<'static>> {
            self.0.get_rows_streaming(id, chunk_size).await
        }
        async fn create_version(
            &self,
            draft: crate::data::access::VersionDraft,
            chunks: crate::data::access::ChunkStream<'_>,
        ) -> Result<String> {
            self.0.create_version(draft, chunks).await
        }
        async fn lineage_edge(&self, id: &str) -> Result<Option<crate::lineage::LineageEdge>> {
            self.0.lineage_edge(id).await
        }
        async fn children(&self, id: &str) -> Result<Vec<String>> {
            self.0.children(id).await
        }
        async fn list_versions(&self) -> Result<Vec<crate::data::access::DatasetVersion>> {
            self.0.list_versions().await
        }
    }

    #[tokio::test]
    async fn test_superseded_request_is_discarded() {
        let (access, _, id) = setup(PreviewConfig::default()).await;
        let engine = PreviewEngine::new(
            Arc::new(TransformationRegistry::with_builtins()),
            Arc::new(SlowAccess(access)),
            Arc::new(BasicStats),
            PreviewConfig::default(),
        );
        let session = PreviewSession::new(Arc::new(engine));
        let pipeline = Pipeline::new(&id).with_step("trim_whitespace", json!({}));
        let (first, second) = tokio::join!(
            session.request(&pipeline, Some(10)),
            session.request(&pipeline, Some(20)),
        );
        assert!(first.unwrap().is_none());
        assert_eq!(second.unwrap().unwrap().sample_size, 20);
        assert_eq!(session.current(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_execution_error() {
        let (access, _, id) = setup(PreviewConfig::default()).await;
        let config = PreviewConfig {
            timeout_ms: 1,
            ..PreviewConfig::default()
        };
        let engine = PreviewEngine::new(
            Arc::new(TransformationRegistry::with_builtins()),
            Arc::new(SlowAccess(access)),
            Arc::new(BasicStats),
            config,
        );
        let err = engine.preview(&Pipeline::new(&id), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("timed out"));
    }
}
