//! The catalog of transformation types.
//!
//! Types are registered once at startup (`with_builtins`) and looked up by id
//! during validation and execution. New types are added by registering another
//! `Transformation` implementation; execution code never branches on ids.

use crate::data::schema::{ColumnType, SchemaDefinition};
use crate::error::{RefineryError, Result};
use crate::pipeline::Params;
use crate::transform::kernel::Kernel;
use crate::transform::params::{ParamReader, ParamSpec};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Grouping used by catalogs and exporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Cleaning,
    MissingValues,
    TypeConversion,
    FeatureEngineering,
}

/// Which column types a transformation can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applicability {
    Any,
    Numeric,
    /// Strings, booleans, and integers.
    Categorical,
    Text,
    /// Datetimes or strings that may hold dates.
    Temporal,
}

impl Applicability {
    /// Whether a column of `dtype` may be targeted. Columns with no observed
    /// values (`null`) carry no type evidence and are always accepted.
    pub fn accepts(self, dtype: ColumnType) -> bool {
        if matches!(dtype, ColumnType::Null) {
            return true;
        }
        match self {
            Applicability::Any => true,
            Applicability::Numeric => dtype.is_numeric(),
            Applicability::Categorical => matches!(
                dtype,
                ColumnType::String | ColumnType::Boolean | ColumnType::Integer
            ),
            Applicability::Text => dtype == ColumnType::String,
            Applicability::Temporal => {
                matches!(dtype, ColumnType::DateTime | ColumnType::String)
            }
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Applicability::Any => "any",
            Applicability::Numeric => "numeric",
            Applicability::Categorical => "categorical",
            Applicability::Text => "text",
            Applicability::Temporal => "temporal",
        }
    }
}

/// A transformation type.
pub trait Transformation: Send + Sync {
    fn id(&self) -> &'static str;

    fn category(&self) -> Category;

    fn description(&self) -> &'static str;

    fn parameters(&self) -> &[ParamSpec];

    fn applicability(&self) -> Applicability;

    /// Columns the step reads, given checked parameters and its input schema.
    /// Explicitly named columns are returned even when absent so the validator
    /// can report them.
    fn input_columns(&self, params: &Params, schema: &SchemaDefinition) -> Vec<String>;

    /// Symbolic output schema, computed without touching data.
    fn output_schema(&self, params: &Params, input: &SchemaDefinition) -> SchemaDefinition;

    /// Build an executable kernel for the given parameters and input schema.
    fn kernel(&self, params: &Params, input: &SchemaDefinition) -> Result<Box<dyn Kernel>>;
}

/// How a built-in picks its target columns.
#[derive(Debug, Clone, Copy)]
pub enum Targets {
    /// A list parameter; when absent, every column the type applies to.
    ColumnsOrAll(&'static str),
    /// A required list parameter.
    Columns(&'static str),
    /// A single-column parameter.
    Column(&'static str),
}

pub type SchemaFn = fn(&ParamReader<'_>, &[String], &SchemaDefinition) -> SchemaDefinition;
pub type KernelFn = fn(&ParamReader<'_>, Vec<String>) -> Result<Box<dyn Kernel>>;

/// Table-driven definition shared by all built-in types.
pub struct BuiltinTransformation {
    pub id: &'static str,
    pub category: Category,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    pub applicability: Applicability,
    pub targets: Targets,
    pub schema: SchemaFn,
    pub kernel: KernelFn,
}

impl Transformation for BuiltinTransformation {
    fn id(&self) -> &'static str {
        self.id
    }

    fn category(&self) -> Category {
        self.category
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn parameters(&self) -> &[ParamSpec] {
        self.params
    }

    fn applicability(&self) -> Applicability {
        self.applicability
    }

    fn input_columns(&self, params: &Params, schema: &SchemaDefinition) -> Vec<String> {
        let reader = ParamReader::new(self.params, params);
        match self.targets {
            Targets::ColumnsOrAll(name) => reader.columns(name).unwrap_or_else(|| {
                let applicability = self.applicability;
                schema.names_of(|t| applicability.accepts(t))
            }),
            Targets::Columns(name) => reader.columns(name).unwrap_or_default(),
            Targets::Column(name) => reader.string(name).into_iter().collect(),
        }
    }

    fn output_schema(&self, params: &Params, input: &SchemaDefinition) -> SchemaDefinition {
        let reader = ParamReader::new(self.params, params);
        let targets = self.input_columns(params, input);
        (self.schema)(&reader, &targets, input)
    }

    fn kernel(&self, params: &Params, input: &SchemaDefinition) -> Result<Box<dyn Kernel>> {
        let reader = ParamReader::new(self.params, params);
        let targets = self.input_columns(params, input);
        (self.kernel)(&reader, targets)
    }
}

/// Catalog entry as exposed to API callers.
#[derive(Debug, Clone, Serialize)]
pub struct TransformationInfo {
    pub id: &'static str,
    pub category: Category,
    pub description: &'static str,
    pub applicability: Applicability,
    pub parameters: Vec<ParamSpec>,
}

/// The registry of transformation types.
pub struct TransformationRegistry {
    types: BTreeMap<&'static str, Arc<dyn Transformation>>,
}

impl TransformationRegistry {
    pub fn new() -> Self {
        Self {
            types: BTreeMap::new(),
        }
    }

    /// A registry holding every built-in transformation.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for def in crate::transform::builtins() {
            // Built-in ids are unique.
            let _ = registry.register(Arc::new(def));
        }
        registry
    }

    /// Register a type. Fails if the id is already taken.
    pub fn register(&mut self, transformation: Arc<dyn Transformation>) -> Result<()> {
        let id = transformation.id();
        if self.types.contains_key(id) {
            return Err(RefineryError::config(format!(
                "transformation '{id}' is already registered"
            )));
        }
        debug!(transformation = %id, "Registering transformation");
        self.types.insert(id, transformation);
        Ok(())
    }

    pub fn lookup(&self, type_id: &str) -> Result<Arc<dyn Transformation>> {
        self.types
            .get(type_id)
            .cloned()
            .ok_or_else(|| RefineryError::not_found(format!("transformation type '{type_id}'")))
    }

    pub fn parameter_schema(&self, type_id: &str) -> Result<Vec<ParamSpec>> {
        Ok(self.lookup(type_id)?.parameters().to_vec())
    }

    pub fn info(&self, type_id: &str) -> Result<TransformationInfo> {
        let t = self.lookup(type_id)?;
        Ok(TransformationInfo {
            id: t.id(),
            category: t.category(),
            description: t.description(),
            applicability: t.applicability(),
            parameters: t.parameters().to_vec(),
        })
    }

    /// All types, sorted by category then id.
    pub fn list(&self) -> Vec<TransformationInfo> {
        let mut infos: Vec<TransformationInfo> = self
            .types
            .keys()
            .filter_map(|id| self.info(id).ok())
            .collect();
        infos.sort_by(|a, b| a.category.cmp(&b.category).then(a.id.cmp(b.id)));
        infos
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for TransformationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
