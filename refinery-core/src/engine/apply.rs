//! Apply Engine: execute a pipeline over a full dataset version and commit
//! the result as a new immutable version.

use crate::config::ApplyConfig;
use crate::data::access::{DatasetAccess, VersionDraft};
use crate::engine::executor::{ChunkSource, CompiledPipeline, VersionSource};
use crate::engine::validate::validate;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::transform::kernel::{ExecMode, StepDiagnostics};
use crate::transform::registry::TransformationRegistry;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPhase {
    #[default]
    Pending,
    Validating,
    Fitting,
    Writing,
    Committed,
    Failed,
}

/// Progress of one apply, published through a `watch` channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyProgress {
    pub phase: ApplyPhase,
    /// Step being fitted during [`ApplyPhase::Fitting`].
    pub step: Option<usize>,
    pub chunks_written: usize,
    pub rows_written: usize,
}

/// Diagnostics of a full-data run.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyDiagnostics {
    pub steps: Vec<StepDiagnostics>,
    pub rows_before: usize,
    pub rows_after: usize,
    pub columns_before: Vec<String>,
    pub columns_after: Vec<String>,
    pub chunks_processed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub new_version_id: String,
    pub diagnostics: ApplyDiagnostics,
}

/// What to apply and on whose behalf.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub pipeline: Pipeline,
    pub requested_by: String,
    /// Recipe the steps came from, recorded on the lineage edge.
    pub recipe_id: Option<String>,
    /// Name of the new version; defaults to the source version's name.
    pub name: Option<String>,
}

impl ApplyRequest {
    pub fn new(pipeline: Pipeline, requested_by: impl Into<String>) -> Self {
        Self {
            pipeline,
            requested_by: requested_by.into(),
            recipe_id: None,
            name: None,
        }
    }

    pub fn with_recipe(mut self, recipe_id: impl Into<String>) -> Self {
        self.recipe_id = Some(recipe_id.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

fn report(progress: Option<&watch::Sender<ApplyProgress>>, update: impl FnOnce(&mut ApplyProgress)) {
    if let Some(tx) = progress {
        tx.send_modify(update);
    }
}

/// Executes pipelines over full dataset versions.
pub struct ApplyEngine {
    registry: Arc<TransformationRegistry>,
    access: Arc<dyn DatasetAccess>,
    config: ApplyConfig,
}

impl ApplyEngine {
    pub fn new(
        registry: Arc<TransformationRegistry>,
        access: Arc<dyn DatasetAccess>,
        config: ApplyConfig,
    ) -> Self {
        Self {
            registry,
            access,
            config,
        }
    }

    /// Apply `pipeline` to its source version on behalf of `requested_by`.
    pub async fn apply(&self, pipeline: &Pipeline, requested_by: &str) -> Result<ApplyOutcome> {
        self.execute(ApplyRequest::new(pipeline.clone(), requested_by), None)
            .await
    }

    /// Apply with full request options and optional progress reporting.
    pub async fn execute(
        &self,
        request: ApplyRequest,
        progress: Option<&watch::Sender<ApplyProgress>>,
    ) -> Result<ApplyOutcome> {
        let result = self.run(&request, progress).await;
        match &result {
            Ok(outcome) => {
                report(progress, |p| p.phase = ApplyPhase::Committed);
                info!(
                    source = %request.pipeline.source_version,
                    version = %outcome.new_version_id,
                    pipeline = %request.pipeline.id,
                    requested_by = %request.requested_by,
                    rows = outcome.diagnostics.rows_after,
                    steps = request.pipeline.len(),
                    "Applied pipeline"
                );
            }
            Err(e) => {
                report(progress, |p| p.phase = ApplyPhase::Failed);
                warn!(
                    source = %request.pipeline.source_version,
                    pipeline = %request.pipeline.id,
                    error = %e,
                    "Apply failed"
                );
            }
        }
        result
    }

    async fn run(
        &self,
        request: &ApplyRequest,
        progress: Option<&watch::Sender<ApplyProgress>>,
    ) -> Result<ApplyOutcome> {
        let pipeline = &request.pipeline;
        report(progress, |p| p.phase = ApplyPhase::Validating);
        let source_version = self.access.get_version(&pipeline.source_version).await?;
        validate(&self.registry, pipeline, &source_version.schema)?;

        let source = VersionSource::new(
            Arc::clone(&self.access),
            &source_version.id,
            self.config.chunk_size,
        );
        let mut compiled = CompiledPipeline::compile(
            &self.registry,
            pipeline,
            &source_version.schema,
            &source,
            ExecMode::Strict,
            |step, step_type| {
                debug!(step, step_type, "Fitting step over full data");
                report(progress, |p| {
                    p.phase = ApplyPhase::Fitting;
                    p.step = Some(step);
                });
            },
        )
        .await?;

        report(progress, |p| {
            p.phase = ApplyPhase::Writing;
            p.step = None;
        });
        let draft = VersionDraft {
            name: request
                .name
                .clone()
                .unwrap_or_else(|| source_version.name.clone()),
            parent_id: source_version.id.clone(),
            schema: compiled.output_schema().clone(),
            pipeline: pipeline.snapshot(request.recipe_id.clone()),
            requested_by: request.requested_by.clone(),
        };
        let chunks = source.open().await?;
        let written = compiled
            .run(chunks)
            .inspect(move |chunk| {
                if let Ok(batch) = chunk {
                    report(progress, |p| {
                        p.chunks_written += 1;
                        p.rows_written += batch.row_count();
                    });
                }
            })
            .boxed();
        let new_version_id = self.access.create_version(draft, written).await?;

        let created = self.access.get_version(&new_version_id).await?;
        Ok(ApplyOutcome {
            new_version_id,
            diagnostics: ApplyDiagnostics {
                steps: compiled.diagnostics(),
                rows_before: source_version.row_count,
                rows_after: created.row_count,
                columns_before: source_version.schema.names(),
                columns_after: created.schema.names(),
                chunks_processed: compiled.chunks_processed(),
            },
        })
    }
}
