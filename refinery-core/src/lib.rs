//! # Refinery Core
//!
//! Composable data-cleaning pipelines over versioned tabular datasets.
//! Provides the transformation registry, pipeline validation, sample
//! previews, versioned apply with lineage, a SQLite recipe store, and code
//! export.

pub mod api;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod export;
pub mod lineage;
pub mod persistence;
pub mod pipeline;
pub mod recipes;
pub mod transform;

// Re-export commonly used types at the crate root.
pub use api::Refinery;
pub use config::{RefineryConfig, load_config};
pub use data::{
    ChunkStream, ColumnSchema, ColumnType, DataBatch, DatasetAccess, DatasetVersion,
    FsDatasetAccess, InMemoryDatasetAccess, SchemaDefinition, StatsProvider,
};
pub use engine::{
    ApplyDiagnostics, ApplyEngine, ApplyOutcome, ApplyPhase, ApplyProgress, ApplyRequest,
    PreviewEngine, PreviewResult, PreviewSession, ValidationReport,
};
pub use error::{ErrorKind, RefineryError, Result, Violation};
pub use export::{ExportTarget, export, import_script};
pub use lineage::{LineageEdge, LineageReport, LineageTracker};
pub use pipeline::{Params, Pipeline, PipelineEdit, PipelineHistory, TransformationStep};
pub use recipes::{
    NewRecipe, Rating, Recipe, RecipeFilter, RecipePage, RecipeUpdate, SqliteRecipeStore,
    Visibility,
};
pub use transform::{Category, ExecMode, TransformationRegistry};
