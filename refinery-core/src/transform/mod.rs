//! Transformation types, their parameters, and the kernels that execute them.

pub mod cleaning;
pub mod convert;
pub mod features;
pub mod kernel;
pub mod missing;
pub mod params;
pub mod registry;

pub use kernel::{ExecMode, Kernel, StepContext, StepDiagnostics};
pub use params::{ParamDefault, ParamKind, ParamSpec};
pub use registry::{
    Applicability, BuiltinTransformation, Category, Transformation, TransformationInfo,
    TransformationRegistry,
};

use crate::data::schema::SchemaDefinition;
use params::ParamReader;

/// Every built-in transformation type.
pub fn builtins() -> Vec<BuiltinTransformation> {
    let mut all = cleaning::definitions();
    all.extend(missing::definitions());
    all.extend(convert::definitions());
    all.extend(features::definitions());
    all
}

pub(crate) fn unchanged_schema(
    _params: &ParamReader<'_>,
    _targets: &[String],
    input: &SchemaDefinition,
) -> SchemaDefinition {
    input.clone()
}
