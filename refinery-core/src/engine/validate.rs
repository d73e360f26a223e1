//! Pre-flight validation of a pipeline against a source schema.

use crate::data::schema::SchemaDefinition;
use crate::error::{RefineryError, Result, Violation};
use crate::pipeline::Pipeline;
use crate::transform::params::check_params;
use crate::transform::registry::TransformationRegistry;
use serde::Serialize;

/// Symbolic schemas computed by a successful validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Output schema of each step, in order.
    pub step_schemas: Vec<SchemaDefinition>,
    pub output_schema: SchemaDefinition,
}

/// Validate every step in order against the schema produced by the steps
/// before it. All violations of the first invalid step are reported together.
pub fn validate(
    registry: &TransformationRegistry,
    pipeline: &Pipeline,
    source_schema: &SchemaDefinition,
) -> Result<ValidationReport> {
    let mut schema = source_schema.clone();
    let mut step_schemas = Vec::with_capacity(pipeline.len());

    for (index, step) in pipeline.steps.iter().enumerate() {
        let fail = |violations: Vec<Violation>| RefineryError::Validation {
            step_index: index,
            step_type: step.type_id.clone(),
            violations,
        };

        let transformation = registry.lookup(&step.type_id).map_err(|_| {
            fail(vec![Violation::new(
                "type",
                format!("transformation type '{}' not found", step.type_id),
            )])
        })?;

        let mut violations = Vec::new();
        if step.order != index {
            violations.push(Violation::new(
                "order",
                format!("expected order {index}, found {}", step.order),
            ));
        }
        violations.extend(check_params(transformation.parameters(), &step.params));

        let applicability = transformation.applicability();
        for column in transformation.input_columns(&step.params, &schema) {
            match schema.resolve(&column) {
                None => violations.push(Violation::new(column.as_str(), "column not found")),
                Some(dtype) if !applicability.accepts(dtype) => violations.push(Violation::new(
                    column.as_str(),
                    format!("column type {dtype} is not {}", applicability.describe()),
                )),
                Some(_) => {}
            }
        }

        if !violations.is_empty() {
            return Err(fail(violations));
        }

        schema = transformation.output_schema(&step.params, &schema);
        step_schemas.push(schema.clone());
    }

    Ok(ValidationReport {
        step_schemas,
        output_schema: schema,
    })
}
