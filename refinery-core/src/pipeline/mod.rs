//! Pipelines, steps, and edit history.

pub mod history;
pub mod step;

pub use history::{PipelineEdit, PipelineHistory};
pub use step::{Params, Pipeline, PipelineSnapshot, TransformationStep};
