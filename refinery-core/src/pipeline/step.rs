//! Transformation steps and the pipelines that order them.
//!
//! Pipelines are values: every structural edit returns a new `Pipeline`
//! and leaves the original untouched, which is what the edit history relies on.

use crate::error::{RefineryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Step parameters, ordered by name so hashing and export are stable.
pub type Params = BTreeMap<String, Value>;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One configured operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationStep {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub order: usize,
}

impl TransformationStep {
    /// Create a step from a JSON object of parameters. Non-object values yield no parameters.
    pub fn new(type_id: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map.into_iter().collect(),
            _ => Params::new(),
        };
        Self {
            id: new_id(),
            type_id: type_id.into(),
            params,
            order: 0,
        }
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// An ordered sequence of steps bound to a source dataset version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default = "new_id")]
    pub id: String,
    pub source_version: String,
    #[serde(default)]
    pub steps: Vec<TransformationStep>,
}

impl Pipeline {
    pub fn new(source_version: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            source_version: source_version.into(),
            steps: Vec::new(),
        }
    }

    /// Build a pipeline from existing steps, renumbering their order.
    pub fn from_steps(source_version: impl Into<String>, steps: Vec<TransformationStep>) -> Self {
        let mut pipeline = Self::new(source_version);
        pipeline.steps = steps;
        pipeline.renumber();
        pipeline
    }

    /// Builder-style append.
    pub fn with_step(mut self, type_id: &str, params: Value) -> Self {
        self.steps.push(TransformationStep::new(type_id, params));
        self.renumber();
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, step_id: &str) -> Option<&TransformationStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    fn index_of(&self, step_id: &str) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| RefineryError::not_found(format!("step '{step_id}'")))
    }

    fn renumber(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.order = i;
        }
    }

    fn edited(&self, f: impl FnOnce(&mut Vec<TransformationStep>)) -> Self {
        let mut next = self.clone();
        f(&mut next.steps);
        next.renumber();
        next
    }

    /// Append a step.
    pub fn add_step(&self, step: TransformationStep) -> Self {
        self.edited(|steps| steps.push(step))
    }

    /// Insert a step at `index` (clamped to the end).
    pub fn insert_step(&self, index: usize, step: TransformationStep) -> Self {
        self.edited(|steps| {
            let index = index.min(steps.len());
            steps.insert(index, step);
        })
    }

    pub fn remove_step(&self, step_id: &str) -> Result<Self> {
        let idx = self.index_of(step_id)?;
        Ok(self.edited(|steps| {
            steps.remove(idx);
        }))
    }

    /// Move a step to `new_index` (clamped to the last position).
    pub fn move_step(&self, step_id: &str, new_index: usize) -> Result<Self> {
        let idx = self.index_of(step_id)?;
        Ok(self.edited(|steps| {
            let step = steps.remove(idx);
            let target = new_index.min(steps.len());
            steps.insert(target, step);
        }))
    }

    pub fn set_params(&self, step_id: &str, params: Params) -> Result<Self> {
        let idx = self.index_of(step_id)?;
        Ok(self.edited(|steps| steps[idx].params = params))
    }

    /// The same steps bound to a different source version.
    pub fn rebind(&self, source_version: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.source_version = source_version.into();
        next
    }

    /// Sort steps by their order index (stable) and renumber to `0..n`.
    /// Used for pipelines loaded from files where `order` may be omitted.
    pub fn normalized(mut self) -> Self {
        self.steps.sort_by_key(|s| s.order);
        self.renumber();
        self
    }

    /// Whether order indices form the strict sequence `0..n` in list order.
    pub fn is_well_ordered(&self) -> bool {
        self.steps.iter().enumerate().all(|(i, s)| s.order == i)
    }

    /// SHA-256 over the ordered step types and parameters. Step ids and the
    /// source version do not participate, so identical edits hash identically.
    pub fn content_hash(&self) -> String {
        let canonical: Vec<(&str, &Params)> = self
            .steps
            .iter()
            .map(|s| (s.type_id.as_str(), &s.params))
            .collect();
        let json = serde_json::to_string(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Freeze into the snapshot recorded on lineage edges.
    pub fn snapshot(&self, recipe_id: Option<String>) -> PipelineSnapshot {
        PipelineSnapshot {
            pipeline_id: self.id.clone(),
            recipe_id,
            steps: self.steps.clone(),
            content_hash: self.content_hash(),
        }
    }
}

/// The exact steps and parameters that produced a dataset version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub pipeline_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_id: Option<String>,
    pub steps: Vec<TransformationStep>,
    pub content_hash: String,
}

impl PipelineSnapshot {
    /// Rebuild a pipeline with these steps against `source_version`.
    pub fn to_pipeline(&self, source_version: impl Into<String>) -> Pipeline {
        Pipeline::from_steps(source_version, self.steps.clone())
    }
}
