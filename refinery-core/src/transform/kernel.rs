//! The execution contract every transformation implements.
//!
//! A kernel is the pure function `(rows, schema, params) -> (rows, schema, diagnostics)`
//! split into phases so it can run over a single in-memory batch or over a
//! restartable stream of chunks:
//!
//! 1. `observe` is called for every chunk of the kernel's input during a fit
//!    pass (only when `needs_fit` is true), followed by `end_fit`.
//! 2. `process` transforms chunks in order, one output chunk per input chunk.
//! 3. `reset` clears per-pass carry state (never fitted state) before a pass.

use crate::data::batch::DataBatch;
use crate::data::schema::SchemaDefinition;
use crate::error::{RefineryError, Result};
use serde::{Deserialize, Serialize};

/// How cell-level failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Apply: a cell that violates the step's expectations aborts execution.
    Strict,
    /// Preview: such cells are left as-is and reported as warnings.
    Lenient,
}

/// Diagnostics gathered for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDiagnostics {
    pub step_id: String,
    pub step_type: String,
    pub order: usize,
    pub rows_in: usize,
    pub rows_out: usize,
    pub rows_affected: usize,
    pub columns_added: Vec<String>,
    pub columns_removed: Vec<String>,
    pub coercion_failures: usize,
    pub cell_errors: usize,
    pub warnings: Vec<String>,
}

/// Mutable context handed to a kernel while it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub mode: ExecMode,
    pub diagnostics: StepDiagnostics,
}

impl StepContext {
    pub fn new(mode: ExecMode, step_id: &str, step_type: &str, order: usize) -> Self {
        Self {
            mode,
            diagnostics: StepDiagnostics {
                step_id: step_id.to_string(),
                step_type: step_type.to_string(),
                order,
                ..StepDiagnostics::default()
            },
        }
    }

    pub fn affected(&mut self, rows: usize) {
        self.diagnostics.rows_affected += rows;
    }

    pub fn coerced(&mut self, failures: usize) {
        self.diagnostics.coercion_failures += failures;
    }

    /// Record a warning once.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.diagnostics.warnings.contains(&message) {
            self.diagnostics.warnings.push(message);
        }
    }

    /// A cell the step cannot handle: fatal in strict mode, a warning otherwise.
    pub fn cell_error(&mut self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        match self.mode {
            ExecMode::Strict => Err(RefineryError::execution(format!(
                "step {} ({}): {message}",
                self.diagnostics.order, self.diagnostics.step_type
            ))),
            ExecMode::Lenient => {
                self.diagnostics.cell_errors += 1;
                self.warn(message);
                Ok(())
            }
        }
    }
}

/// A configured, executable transformation.
pub trait Kernel: Send {
    /// Whether the kernel needs a full pass over its input before processing.
    fn needs_fit(&self) -> bool {
        false
    }

    fn observe(&mut self, _batch: &DataBatch, _ctx: &mut StepContext) -> Result<()> {
        Ok(())
    }

    fn end_fit(&mut self, _ctx: &mut StepContext) {}

    /// Clear carry state before a new pass over the data.
    fn reset(&mut self) {}

    /// Output schema when it depends on fitted data; `None` defers to the
    /// transformation's symbolic schema.
    fn output_schema(&self, _input: &SchemaDefinition) -> Option<SchemaDefinition> {
        None
    }

    fn process(&mut self, batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch>;
}

/// Resolve column names to indices in `batch`, failing on absent columns.
pub fn column_indices(batch: &DataBatch, names: &[String]) -> Result<Vec<usize>> {
    names.iter().map(|n| batch.require_column(n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_error_strict_vs_lenient() {
        let mut strict = StepContext::new(ExecMode::Strict, "s1", "create_bins", 3);
        let err = strict.cell_error("non-numeric value 'x'").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Execution error: step 3 (create_bins): non-numeric value 'x'"
        );

        let mut lenient = StepContext::new(ExecMode::Lenient, "s1", "create_bins", 3);
        lenient.cell_error("non-numeric value 'x'").unwrap();
        lenient.cell_error("non-numeric value 'x'").unwrap();
        assert_eq!(lenient.diagnostics.cell_errors, 2);
        assert_eq!(lenient.diagnostics.warnings.len(), 1);
    }
}
