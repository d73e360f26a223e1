//! Linear pipeline execution over a restartable chunk source.
//!
//! Compilation builds one kernel per step against the concrete schema
//! produced by the steps before it. A kernel that needs whole-data state is
//! fitted right after it is built: the source is replayed through the
//! already-compiled prefix and every chunk reaching the kernel is observed.
//! The write pass then streams the source through all kernels once.

use crate::data::access::{ChunkStream, DatasetAccess};
use crate::data::batch::DataBatch;
use crate::data::schema::SchemaDefinition;
use crate::engine::validate::validate;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::transform::kernel::{ExecMode, Kernel, StepContext, StepDiagnostics};
use crate::transform::registry::TransformationRegistry;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// A source that can be read from the start any number of times.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn open(&self) -> Result<ChunkStream<'static>>;
}

/// An in-memory batch split into fixed-size chunks.
pub struct BatchSource {
    batch: DataBatch,
    chunk_size: usize,
}

impl BatchSource {
    pub fn new(batch: DataBatch, chunk_size: usize) -> Self {
        Self { batch, chunk_size }
    }
}

#[async_trait]
impl ChunkSource for BatchSource {
    async fn open(&self) -> Result<ChunkStream<'static>> {
        let chunks = self.batch.clone().into_chunks(self.chunk_size);
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// All rows of a stored dataset version.
pub struct VersionSource {
    access: Arc<dyn DatasetAccess>,
    version_id: String,
    chunk_size: usize,
}

impl VersionSource {
    pub fn new(access: Arc<dyn DatasetAccess>, version_id: &str, chunk_size: usize) -> Self {
        Self {
            access,
            version_id: version_id.to_string(),
            chunk_size,
        }
    }
}

#[async_trait]
impl ChunkSource for VersionSource {
    async fn open(&self) -> Result<ChunkStream<'static>> {
        self.access
            .get_rows_streaming(&self.version_id, self.chunk_size)
            .await
    }
}

struct CompiledStep {
    kernel: Box<dyn Kernel>,
    ctx: StepContext,
    output_schema: SchemaDefinition,
}

impl CompiledStep {
    fn process(&mut self, batch: DataBatch) -> Result<DataBatch> {
        self.ctx.diagnostics.rows_in += batch.row_count();
        let out = self.kernel.process(batch, &mut self.ctx)?;
        self.ctx.diagnostics.rows_out += out.row_count();
        Ok(out)
    }
}

fn push(steps: &mut [CompiledStep], batch: DataBatch) -> Result<DataBatch> {
    steps.iter_mut().try_fold(batch, |batch, step| step.process(batch))
}

/// A pipeline with every kernel built and fitted.
pub struct CompiledPipeline {
    steps: Vec<CompiledStep>,
    source_schema: SchemaDefinition,
    chunks: usize,
}

impl CompiledPipeline {
    /// Build and fit every kernel. `on_fit` is called with the step index and
    /// type before each fit pass.
    pub async fn compile<S>(
        registry: &TransformationRegistry,
        pipeline: &Pipeline,
        source_schema: &SchemaDefinition,
        source: &S,
        mode: ExecMode,
        mut on_fit: impl FnMut(usize, &str) + Send,
    ) -> Result<Self>
    where
        S: ChunkSource + ?Sized,
    {
        let mut compiled = Self {
            steps: Vec::with_capacity(pipeline.len()),
            source_schema: source_schema.clone(),
            chunks: 0,
        };
        let mut schema = source_schema.clone();

        for step in &pipeline.steps {
            let transformation = registry.lookup(&step.type_id)?;
            let kernel = transformation.kernel(&step.params, &schema)?;
            compiled.steps.push(CompiledStep {
                kernel,
                ctx: StepContext::new(mode, &step.id, &step.type_id, step.order),
                output_schema: SchemaDefinition::default(),
            });
            let i = compiled.steps.len() - 1;

            if compiled.steps[i].kernel.needs_fit() {
                on_fit(i, &step.type_id);
                compiled.fit(i, source).await?;
            }

            let output = compiled.steps[i]
                .kernel
                .output_schema(&schema)
                .unwrap_or_else(|| transformation.output_schema(&step.params, &schema));
            let before = schema.names();
            let after = output.names();
            let current = &mut compiled.steps[i];
            current.ctx.diagnostics.columns_added =
                after.iter().filter(|c| !before.contains(c)).cloned().collect();
            current.ctx.diagnostics.columns_removed =
                before.iter().filter(|c| !after.contains(c)).cloned().collect();
            current.output_schema = output.clone();
            schema = output;
        }

        Ok(compiled)
    }

    async fn fit<S>(&mut self, i: usize, source: &S) -> Result<()>
    where
        S: ChunkSource + ?Sized,
    {
        // Upstream steps replay into throwaway contexts so their write-pass
        // diagnostics only count the write pass.
        let saved: Vec<StepContext> = self.steps[..i].iter().map(|s| s.ctx.clone()).collect();
        for step in &mut self.steps[..=i] {
            step.kernel.reset();
        }

        let mut chunks = source.open().await?;
        let (upstream, rest) = self.steps.split_at_mut(i);
        let target = &mut rest[0];
        let result: Result<()> = async {
            while let Some(chunk) = chunks.next().await {
                let out = push(upstream, chunk?)?;
                target.kernel.observe(&out, &mut target.ctx)?;
            }
            Ok(())
        }
        .await;

        for (step, ctx) in self.steps.iter_mut().zip(saved) {
            step.ctx = ctx;
        }
        result?;

        let target = &mut self.steps[i];
        target.kernel.end_fit(&mut target.ctx);
        debug!(
            step = i,
            step_type = %target.ctx.diagnostics.step_type,
            "Fitted step"
        );
        Ok(())
    }

    /// Stream `source` through every step. Call once per compiled pipeline;
    /// diagnostics accumulate over the pass.
    pub fn run<'a>(&'a mut self, source: ChunkStream<'a>) -> ChunkStream<'a> {
        for step in &mut self.steps {
            step.kernel.reset();
        }
        stream::unfold((Some(source), self), |(source, pipeline)| async move {
            let mut source = source?;
            match source.next().await {
                Some(Ok(chunk)) => {
                    pipeline.chunks += 1;
                    let out = push(&mut pipeline.steps, chunk);
                    let next = out.is_ok().then_some(source);
                    Some((out, (next, pipeline)))
                }
                Some(Err(e)) => Some((Err(e), (None, pipeline))),
                None => None,
            }
        })
        .boxed()
    }

    pub fn output_schema(&self) -> &SchemaDefinition {
        self.steps
            .last()
            .map(|s| &s.output_schema)
            .unwrap_or(&self.source_schema)
    }

    pub fn diagnostics(&self) -> Vec<StepDiagnostics> {
        self.steps.iter().map(|s| s.ctx.diagnostics.clone()).collect()
    }

    /// Source chunks consumed by the write pass.
    pub fn chunks_processed(&self) -> usize {
        self.chunks
    }
}

/// Output of running a pipeline over one in-memory batch.
#[derive(Debug, Clone, Serialize)]
pub struct LocalRun {
    pub output: DataBatch,
    pub schema: SchemaDefinition,
    pub steps: Vec<StepDiagnostics>,
}

/// Validate and execute `pipeline` over `batch` without touching any store.
pub async fn run_local(
    registry: &TransformationRegistry,
    pipeline: &Pipeline,
    batch: DataBatch,
    schema: &SchemaDefinition,
    mode: ExecMode,
) -> Result<LocalRun> {
    validate(registry, pipeline, schema)?;
    let chunk_size = batch.row_count().max(1);
    let source = BatchSource::new(batch, chunk_size);
    let mut compiled =
        CompiledPipeline::compile(registry, pipeline, schema, &source, mode, |_, _| {}).await?;

    let mut output = DataBatch::empty(compiled.output_schema().names());
    let chunks = source.open().await?;
    {
        let mut stream = compiled.run(chunks);
        while let Some(chunk) = stream.next().await {
            output.extend(chunk?)?;
        }
    }
    Ok(LocalRun {
        output,
        schema: compiled.output_schema().clone(),
        steps: compiled.diagnostics(),
    })
}
