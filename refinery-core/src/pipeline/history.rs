//! Undo/redo over pipeline edits.
//!
//! The history is a pair of stacks of immutable `Pipeline` snapshots. Nothing
//! here touches persisted state; applying is a separate, explicit call.

use crate::error::Result;
use crate::pipeline::step::{Params, Pipeline, TransformationStep};
use serde::{Deserialize, Serialize};

/// A structural change to an in-progress pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PipelineEdit {
    Add {
        step: TransformationStep,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    Remove {
        step_id: String,
    },
    Move {
        step_id: String,
        index: usize,
    },
    SetParams {
        step_id: String,
        params: Params,
    },
}

impl PipelineEdit {
    /// Produce the edited pipeline without touching `pipeline`.
    pub fn apply_to(&self, pipeline: &Pipeline) -> Result<Pipeline> {
        match self {
            PipelineEdit::Add { step, index: None } => Ok(pipeline.add_step(step.clone())),
            PipelineEdit::Add {
                step,
                index: Some(i),
            } => Ok(pipeline.insert_step(*i, step.clone())),
            PipelineEdit::Remove { step_id } => pipeline.remove_step(step_id),
            PipelineEdit::Move { step_id, index } => pipeline.move_step(step_id, *index),
            PipelineEdit::SetParams { step_id, params } => {
                pipeline.set_params(step_id, params.clone())
            }
        }
    }
}

/// Edit history for one editing session.
#[derive(Debug, Clone)]
pub struct PipelineHistory {
    current: Pipeline,
    undo: Vec<Pipeline>,
    redo: Vec<Pipeline>,
    max_depth: usize,
}

impl PipelineHistory {
    pub fn new(initial: Pipeline, max_depth: usize) -> Self {
        Self {
            current: initial,
            undo: Vec::new(),
            redo: Vec::new(),
            max_depth: max_depth.max(1),
        }
    }

    pub fn current(&self) -> &Pipeline {
        &self.current
    }

    /// Apply an edit. A failed edit leaves the history unchanged; a successful
    /// one clears the redo stack.
    pub fn edit(&mut self, edit: &PipelineEdit) -> Result<&Pipeline> {
        let next = edit.apply_to(&self.current)?;
        let previous = std::mem::replace(&mut self.current, next);
        self.undo.push(previous);
        if self.undo.len() > self.max_depth {
            self.undo.remove(0);
        }
        self.redo.clear();
        Ok(&self.current)
    }

    pub fn undo(&mut self) -> Option<&Pipeline> {
        let previous = self.undo.pop()?;
        let current = std::mem::replace(&mut self.current, previous);
        self.redo.push(current);
        Some(&self.current)
    }

    pub fn redo(&mut self) -> Option<&Pipeline> {
        let next = self.redo.pop()?;
        let current = std::mem::replace(&mut self.current, next);
        self.undo.push(current);
        Some(&self.current)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }
}
