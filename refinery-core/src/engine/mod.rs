//! Validation, preview, and apply over linear pipelines.

pub mod apply;
pub mod executor;
pub mod preview;
pub mod validate;

pub use apply::{
    ApplyDiagnostics, ApplyEngine, ApplyOutcome, ApplyPhase, ApplyProgress, ApplyRequest,
};
pub use executor::{BatchSource, ChunkSource, CompiledPipeline, LocalRun, VersionSource, run_local};
pub use preview::{PreviewCache, PreviewEngine, PreviewResult, PreviewSession};
pub use validate::{ValidationReport, validate};
