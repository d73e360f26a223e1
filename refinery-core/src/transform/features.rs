//! Feature engineering transformations.

use crate::data::batch::DataBatch;
use crate::data::schema::{ColumnSchema, ColumnType, DerivedColumns, SchemaDefinition};
use crate::data::value;
use crate::error::Result;
use crate::transform::kernel::{column_indices, Kernel, StepContext};
use crate::transform::params::{ParamDefault, ParamKind, ParamReader, ParamSpec};
use crate::transform::registry::{Applicability, BuiltinTransformation, Category, Targets};
use chrono::Datelike;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Suffixes appended by `extract_date_parts`, in output order.
pub const DATE_PARTS: [&str; 4] = ["year", "month", "day", "dayofweek"];

const COLUMNS_REQUIRED: &[ParamSpec] = &[ParamSpec::required(
    "columns",
    ParamKind::Columns,
    "Columns to encode",
)];

const CREATE_BINS_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("column", ParamKind::Column, "Numeric column to bin"),
    ParamSpec::with_default(
        "bins",
        ParamKind::Integer { min: Some(2) },
        ParamDefault::Int(5),
        "Number of equal-width bins",
    ),
];

pub(crate) fn definitions() -> Vec<BuiltinTransformation> {
    vec![
        BuiltinTransformation {
            id: "one_hot_encode",
            category: Category::FeatureEngineering,
            description: "Replace each column with one 0/1 column per category",
            params: COLUMNS_REQUIRED,
            applicability: Applicability::Categorical,
            targets: Targets::Columns("columns"),
            schema: one_hot_schema,
            kernel: |_, columns| Ok(Box::new(OneHot::new(columns))),
        },
        BuiltinTransformation {
            id: "label_encode",
            category: Category::FeatureEngineering,
            description: "Replace categories with integer codes in first-seen order",
            params: COLUMNS_REQUIRED,
            applicability: Applicability::Categorical,
            targets: Targets::Columns("columns"),
            schema: label_schema,
            kernel: |_, columns| {
                let codes = vec![HashMap::new(); columns.len()];
                Ok(Box::new(LabelEncode { columns, codes }))
            },
        },
        BuiltinTransformation {
            id: "extract_date_parts",
            category: Category::FeatureEngineering,
            description: "Add year, month, day, and day-of-week columns",
            params: COLUMNS_REQUIRED,
            applicability: Applicability::Temporal,
            targets: Targets::Columns("columns"),
            schema: date_parts_schema,
            kernel: |_, columns| Ok(Box::new(DateParts { columns })),
        },
        BuiltinTransformation {
            id: "create_bins",
            category: Category::FeatureEngineering,
            description: "Assign values to equal-width bins",
            params: CREATE_BINS_PARAMS,
            applicability: Applicability::Numeric,
            targets: Targets::Column("column"),
            schema: bins_schema,
            kernel: |params, mut columns| {
                let column = columns.pop().unwrap_or_default();
                let bins = params.int("bins").unwrap_or(5).max(2) as usize;
                Ok(Box::new(CreateBins::new(column, bins)))
            },
        },
    ]
}

fn one_hot_schema(
    _params: &ParamReader<'_>,
    targets: &[String],
    input: &SchemaDefinition,
) -> SchemaDefinition {
    let mut schema = input.clone();
    for name in targets {
        schema.remove(name);
        schema.derived.push(DerivedColumns {
            prefix: format!("{name}_"),
            dtype: ColumnType::Integer,
        });
    }
    schema
}

fn label_schema(
    _params: &ParamReader<'_>,
    targets: &[String],
    input: &SchemaDefinition,
) -> SchemaDefinition {
    let mut schema = input.clone();
    for name in targets {
        schema.set_type(name, ColumnType::Integer);
    }
    schema
}

fn date_parts_schema(
    _params: &ParamReader<'_>,
    targets: &[String],
    input: &SchemaDefinition,
) -> SchemaDefinition {
    let mut schema = input.clone();
    for name in targets {
        for part in DATE_PARTS {
            schema.upsert(ColumnSchema::new(
                format!("{name}_{part}"),
                ColumnType::Integer,
                true,
            ));
        }
    }
    schema
}

fn bins_schema(
    _params: &ParamReader<'_>,
    targets: &[String],
    input: &SchemaDefinition,
) -> SchemaDefinition {
    let mut schema = input.clone();
    for name in targets {
        schema.upsert(ColumnSchema::new(
            format!("{name}_bin"),
            ColumnType::Integer,
            true,
        ));
    }
    schema
}

struct OneHot {
    columns: Vec<String>,
    categories: Vec<BTreeSet<String>>,
}

impl OneHot {
    fn new(columns: Vec<String>) -> Self {
        let categories = vec![BTreeSet::new(); columns.len()];
        Self {
            columns,
            categories,
        }
    }
}

impl Kernel for OneHot {
    fn needs_fit(&self) -> bool {
        true
    }

    fn observe(&mut self, batch: &DataBatch, _ctx: &mut StepContext) -> Result<()> {
        let idx = column_indices(batch, &self.columns)?;
        for (k, &i) in idx.iter().enumerate() {
            for cell in batch.column_values(i).filter(|c| !c.is_null()) {
                self.categories[k].insert(value::label(cell));
            }
        }
        Ok(())
    }

    fn output_schema(&self, input: &SchemaDefinition) -> Option<SchemaDefinition> {
        let mut schema = input.clone();
        for (name, categories) in self.columns.iter().zip(&self.categories) {
            schema.remove(name);
            for category in categories {
                schema.upsert(ColumnSchema::new(
                    format!("{name}_{category}"),
                    ColumnType::Integer,
                    false,
                ));
            }
        }
        Some(schema)
    }

    fn process(&mut self, mut batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        column_indices(&batch, &self.columns)?;
        let mut touched = vec![false; batch.row_count()];
        for (name, categories) in self.columns.iter().zip(&self.categories) {
            let i = batch.require_column(name)?;
            let labels: Vec<Option<String>> = batch
                .column_values(i)
                .map(|c| (!c.is_null()).then(|| value::label(c)))
                .collect();
            for (t, l) in touched.iter_mut().zip(&labels) {
                *t |= l.is_some();
            }
            batch.drop_column(i);
            for category in categories {
                let indicator = labels
                    .iter()
                    .map(|l| Value::from(i64::from(l.as_deref() == Some(category.as_str()))))
                    .collect();
                batch.put_column(&format!("{name}_{category}"), indicator);
            }
        }
        ctx.affected(touched.iter().filter(|t| **t).count());
        Ok(batch)
    }
}

struct LabelEncode {
    columns: Vec<String>,
    codes: Vec<HashMap<String, i64>>,
}

impl Kernel for LabelEncode {
    fn reset(&mut self) {
        self.codes.iter_mut().for_each(HashMap::clear);
    }

    fn process(&mut self, mut batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let idx = column_indices(&batch, &self.columns)?;
        let mut affected = 0;
        for row in &mut batch.rows {
            let mut changed = false;
            for (k, &i) in idx.iter().enumerate() {
                if row[i].is_null() {
                    continue;
                }
                let codes = &mut self.codes[k];
                let next = codes.len() as i64;
                let code = *codes.entry(value::label(&row[i])).or_insert(next);
                row[i] = Value::from(code);
                changed = true;
            }
            if changed {
                affected += 1;
            }
        }
        ctx.affected(affected);
        Ok(batch)
    }
}

struct DateParts {
    columns: Vec<String>,
}

impl Kernel for DateParts {
    fn process(&mut self, mut batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let idx = column_indices(&batch, &self.columns)?;
        let mut parsed_rows = vec![false; batch.row_count()];
        for (name, &i) in self.columns.iter().zip(&idx) {
            let mut parts: [Vec<Value>; 4] = Default::default();
            for (r, cell) in batch.column_values(i).enumerate() {
                let dt = match cell {
                    Value::Null => None,
                    other => {
                        let dt = value::as_datetime(other);
                        if dt.is_none() {
                            ctx.coerced(1);
                            ctx.warn(format!("column '{name}': some values are not dates"));
                        }
                        dt
                    }
                };
                match dt {
                    Some(dt) => {
                        parsed_rows[r] = true;
                        parts[0].push(Value::from(dt.year()));
                        parts[1].push(Value::from(dt.month()));
                        parts[2].push(Value::from(dt.day()));
                        parts[3].push(Value::from(dt.weekday().num_days_from_monday()));
                    }
                    None => parts.iter_mut().for_each(|p| p.push(Value::Null)),
                }
            }
            for (part, values) in DATE_PARTS.iter().zip(parts) {
                batch.put_column(&format!("{name}_{part}"), values);
            }
        }
        ctx.affected(parsed_rows.iter().filter(|p| **p).count());
        Ok(batch)
    }
}

/// Equal-width binning over `bins` intervals with edges
/// `min + (max - min) * k / bins`. A value on an interior edge belongs to the
/// bin starting there; the maximum lands in the last bin.
struct CreateBins {
    column: String,
    bins: usize,
    min: f64,
    max: f64,
    seen: bool,
}

impl CreateBins {
    fn new(column: String, bins: usize) -> Self {
        Self {
            column,
            bins,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            seen: false,
        }
    }

    fn edge(&self, k: usize) -> f64 {
        self.min + (self.max - self.min) * k as f64 / self.bins as f64
    }

    fn bin(&self, v: f64) -> i64 {
        let width = (self.max - self.min) / self.bins as f64;
        if width <= 0.0 {
            return 0;
        }
        let last = self.bins - 1;
        // The quotient can land one off when an edge is not representable;
        // settle it against the edges themselves.
        let mut idx = ((v - self.min) / width).floor().clamp(0.0, last as f64) as usize;
        while idx < last && v >= self.edge(idx + 1) {
            idx += 1;
        }
        while idx > 0 && v < self.edge(idx) {
            idx -= 1;
        }
        idx as i64
    }
}

impl Kernel for CreateBins {
    fn needs_fit(&self) -> bool {
        true
    }

    fn observe(&mut self, batch: &DataBatch, _ctx: &mut StepContext) -> Result<()> {
        let i = batch.require_column(&self.column)?;
        for x in batch.column_values(i).filter_map(value::as_f64) {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
            self.seen = true;
        }
        Ok(())
    }

    fn end_fit(&mut self, ctx: &mut StepContext) {
        if !self.seen {
            ctx.warn(format!("column '{}': no numeric values to bin", self.column));
        } else if self.min == self.max {
            ctx.warn(format!(
                "column '{}': all values equal, every value lands in bin 0",
                self.column
            ));
        }
    }

    fn process(&mut self, mut batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let i = batch.require_column(&self.column)?;
        let mut labels = Vec::with_capacity(batch.row_count());
        for cell in batch.column_values(i) {
            match value::as_f64(cell) {
                Some(x) => labels.push(Value::from(self.bin(x))),
                None => {
                    if !cell.is_null() {
                        ctx.cell_error(format!(
                            "column '{}': non-numeric value {cell}",
                            self.column
                        ))?;
                    }
                    labels.push(Value::Null);
                }
            }
        }
        ctx.affected(labels.iter().filter(|l| !l.is_null()).count());
        batch.put_column(&format!("{}_bin", self.column), labels);
        Ok(batch)
    }
}
