//! Missing-value transformations: dropping rows and the fill strategies.

use crate::data::batch::DataBatch;
use crate::data::schema::{ColumnType, SchemaDefinition};
use crate::data::value;
use crate::error::Result;
use crate::transform::cleaning::COLUMNS_OPTIONAL;
use crate::transform::kernel::{column_indices, Kernel, StepContext};
use crate::transform::params::{ParamDefault, ParamKind, ParamReader, ParamSpec};
use crate::transform::registry::{Applicability, BuiltinTransformation, Category, Targets};
use crate::transform::unchanged_schema;
use serde_json::Value;
use std::collections::BTreeMap;

const DROP_MISSING_PARAMS: &[ParamSpec] = &[
    COLUMNS_OPTIONAL,
    ParamSpec::with_default(
        "how",
        ParamKind::Choice {
            options: &["any", "all"],
        },
        ParamDefault::Str("any"),
        "Drop a row when any or all targeted cells are null",
    ),
];

const FILL_PROPAGATE_PARAMS: &[ParamSpec] = &[COLUMNS_OPTIONAL];

const FILL_STAT_PARAMS: &[ParamSpec] = &[ParamSpec::required(
    "columns",
    ParamKind::Columns,
    "Numeric columns to fill",
)];

pub(crate) fn definitions() -> Vec<BuiltinTransformation> {
    vec![
        BuiltinTransformation {
            id: "drop_missing",
            category: Category::MissingValues,
            description: "Drop rows with null values in the targeted columns",
            params: DROP_MISSING_PARAMS,
            applicability: Applicability::Any,
            targets: Targets::ColumnsOrAll("columns"),
            schema: drop_missing_schema,
            kernel: |params, columns| {
                let all = params.string("how").as_deref() == Some("all");
                Ok(Box::new(DropMissing { columns, all }))
            },
        },
        BuiltinTransformation {
            id: "fill_forward",
            category: Category::MissingValues,
            description: "Fill nulls with the previous non-null value",
            params: FILL_PROPAGATE_PARAMS,
            applicability: Applicability::Any,
            targets: Targets::ColumnsOrAll("columns"),
            schema: unchanged_schema,
            kernel: |_, columns| {
                let last = vec![None; columns.len()];
                Ok(Box::new(FillForward { columns, last }))
            },
        },
        BuiltinTransformation {
            id: "fill_backward",
            category: Category::MissingValues,
            description: "Fill nulls with the next non-null value",
            params: FILL_PROPAGATE_PARAMS,
            applicability: Applicability::Any,
            targets: Targets::ColumnsOrAll("columns"),
            schema: unchanged_schema,
            kernel: |_, columns| Ok(Box::new(FillBackward::new(columns))),
        },
        BuiltinTransformation {
            id: "fill_mean",
            category: Category::MissingValues,
            description: "Fill nulls with the column mean",
            params: FILL_STAT_PARAMS,
            applicability: Applicability::Numeric,
            targets: Targets::Columns("columns"),
            schema: float_schema,
            kernel: |_, columns| Ok(Box::new(FillStatistic::new(columns, Statistic::Mean))),
        },
        BuiltinTransformation {
            id: "fill_median",
            category: Category::MissingValues,
            description: "Fill nulls with the column median",
            params: FILL_STAT_PARAMS,
            applicability: Applicability::Numeric,
            targets: Targets::Columns("columns"),
            schema: float_schema,
            kernel: |_, columns| Ok(Box::new(FillStatistic::new(columns, Statistic::Median))),
        },
        BuiltinTransformation {
            id: "fill_mode",
            category: Category::MissingValues,
            description: "Fill nulls with the most frequent value",
            params: FILL_STAT_PARAMS,
            applicability: Applicability::Numeric,
            targets: Targets::Columns("columns"),
            schema: unchanged_schema,
            kernel: |_, columns| Ok(Box::new(FillStatistic::new(columns, Statistic::Mode))),
        },
    ]
}

fn drop_missing_schema(
    params: &ParamReader<'_>,
    targets: &[String],
    input: &SchemaDefinition,
) -> SchemaDefinition {
    let mut schema = input.clone();
    if params.string("how").as_deref() != Some("all") {
        for name in targets {
            schema.set_nullable(name, false);
        }
    }
    schema
}

fn float_schema(
    _params: &ParamReader<'_>,
    targets: &[String],
    input: &SchemaDefinition,
) -> SchemaDefinition {
    let mut schema = input.clone();
    for name in targets {
        schema.set_type(name, ColumnType::Float);
    }
    schema
}

struct DropMissing {
    columns: Vec<String>,
    all: bool,
}

impl Kernel for DropMissing {
    fn process(&mut self, batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let idx = column_indices(&batch, &self.columns)?;
        let before = batch.row_count();
        let DataBatch { columns, mut rows } = batch;
        let all = self.all;
        rows.retain(|row| {
            let mut nulls = idx.iter().filter(|&&i| row[i].is_null());
            let drop = if all {
                !idx.is_empty() && nulls.count() == idx.len()
            } else {
                nulls.next().is_some()
            };
            !drop
        });
        ctx.affected(before - rows.len());
        Ok(DataBatch::new(columns, rows))
    }
}

struct FillForward {
    columns: Vec<String>,
    last: Vec<Option<Value>>,
}

impl Kernel for FillForward {
    fn reset(&mut self) {
        self.last.iter_mut().for_each(|v| *v = None);
    }

    fn process(&mut self, mut batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let idx = column_indices(&batch, &self.columns)?;
        let mut affected = 0;
        for row in &mut batch.rows {
            let mut filled = false;
            for (k, &i) in idx.iter().enumerate() {
                if row[i].is_null() {
                    if let Some(v) = &self.last[k] {
                        row[i] = v.clone();
                        filled = true;
                    }
                } else {
                    self.last[k] = Some(row[i].clone());
                }
            }
            if filled {
                affected += 1;
            }
        }
        ctx.affected(affected);
        Ok(batch)
    }
}

/// Backward fill. The fit pass records, per column, the value that ends each
/// run of nulls together with the row position where it appears, so the
/// write pass streams chunks through without holding rows back. State grows
/// with the number of null runs, not the number of rows.
struct FillBackward {
    columns: Vec<String>,
    /// Per column: `(position, value)` of every non-null cell that follows a null.
    run_ends: Vec<Vec<(usize, Value)>>,
    in_run: Vec<bool>,
    cursor: Vec<usize>,
    position: usize,
}

impl FillBackward {
    fn new(columns: Vec<String>) -> Self {
        let n = columns.len();
        Self {
            columns,
            run_ends: vec![Vec::new(); n],
            in_run: vec![false; n],
            cursor: vec![0; n],
            position: 0,
        }
    }
}

impl Kernel for FillBackward {
    fn needs_fit(&self) -> bool {
        true
    }

    fn observe(&mut self, batch: &DataBatch, _ctx: &mut StepContext) -> Result<()> {
        let idx = column_indices(batch, &self.columns)?;
        for (r, row) in batch.rows.iter().enumerate() {
            let position = self.position + r;
            for (k, &i) in idx.iter().enumerate() {
                if row[i].is_null() {
                    self.in_run[k] = true;
                } else if self.in_run[k] {
                    self.run_ends[k].push((position, row[i].clone()));
                    self.in_run[k] = false;
                }
            }
        }
        self.position += batch.row_count();
        Ok(())
    }

    fn reset(&mut self) {
        self.position = 0;
        self.in_run.iter_mut().for_each(|r| *r = false);
        self.cursor.iter_mut().for_each(|c| *c = 0);
    }

    fn process(&mut self, mut batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let idx = column_indices(&batch, &self.columns)?;
        let mut affected = 0;
        for (r, row) in batch.rows.iter_mut().enumerate() {
            let position = self.position + r;
            let mut filled = false;
            for (k, &i) in idx.iter().enumerate() {
                if !row[i].is_null() {
                    continue;
                }
                let ends = &self.run_ends[k];
                let cursor = &mut self.cursor[k];
                while *cursor < ends.len() && ends[*cursor].0 < position {
                    *cursor += 1;
                }
                if let Some((_, v)) = ends.get(*cursor) {
                    row[i] = v.clone();
                    filled = true;
                }
            }
            if filled {
                affected += 1;
            }
        }
        self.position += batch.row_count();
        ctx.affected(affected);
        Ok(batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Statistic {
    Mean,
    Median,
    Mode,
}

#[derive(Default)]
struct ColumnSample {
    values: Vec<f64>,
    counts: BTreeMap<String, (Value, usize)>,
}

/// Fills nulls with a statistic fitted over the whole column.
struct FillStatistic {
    columns: Vec<String>,
    statistic: Statistic,
    samples: Vec<ColumnSample>,
    fill: Vec<Option<Value>>,
}

impl FillStatistic {
    fn new(columns: Vec<String>, statistic: Statistic) -> Self {
        let n = columns.len();
        Self {
            columns,
            statistic,
            samples: (0..n).map(|_| ColumnSample::default()).collect(),
            fill: vec![None; n],
        }
    }

    fn compute(&self, sample: &ColumnSample) -> Option<Value> {
        if sample.values.is_empty() {
            return None;
        }
        match self.statistic {
            Statistic::Mean => {
                let sum: f64 = sample.values.iter().sum();
                Some(value::float(sum / sample.values.len() as f64))
            }
            Statistic::Median => {
                let mut sorted = sample.values.clone();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                let median = if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                };
                Some(value::float(median))
            }
            Statistic::Mode => sample
                .counts
                .values()
                .max_by(|(va, ca), (vb, cb)| ca.cmp(cb).then_with(|| value::compare(vb, va)))
                .map(|(v, _)| v.clone()),
        }
    }
}

impl Kernel for FillStatistic {
    fn needs_fit(&self) -> bool {
        true
    }

    fn observe(&mut self, batch: &DataBatch, _ctx: &mut StepContext) -> Result<()> {
        let idx = column_indices(batch, &self.columns)?;
        for (k, &i) in idx.iter().enumerate() {
            let sample = &mut self.samples[k];
            for cell in batch.column_values(i) {
                let Some(x) = value::as_f64(cell) else {
                    continue;
                };
                if self.statistic == Statistic::Mode {
                    let entry = sample
                        .counts
                        .entry(value::row_key([cell]))
                        .or_insert_with(|| (cell.clone(), 0));
                    entry.1 += 1;
                } else {
                    sample.values.push(x);
                }
            }
        }
        Ok(())
    }

    fn end_fit(&mut self, ctx: &mut StepContext) {
        for k in 0..self.columns.len() {
            let fill = self.compute(&self.samples[k]);
            if fill.is_none() {
                ctx.warn(format!(
                    "column '{}': all values null after fill",
                    self.columns[k]
                ));
            }
            self.fill[k] = fill;
        }
        self.samples = (0..self.columns.len()).map(|_| ColumnSample::default()).collect();
    }

    fn process(&mut self, mut batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let idx = column_indices(&batch, &self.columns)?;
        let to_float = self.statistic != Statistic::Mode;
        let mut affected = 0;
        for row in &mut batch.rows {
            let mut filled = false;
            for (k, &i) in idx.iter().enumerate() {
                let cell = &row[i];
                if cell.is_null() {
                    if let Some(v) = &self.fill[k] {
                        row[i] = v.clone();
                        filled = true;
                    }
                } else if let Some(x) = value::as_f64(cell) {
                    if to_float {
                        row[i] = value::float(x);
                    }
                } else {
                    ctx.cell_error(format!(
                        "column '{}': non-numeric value {}",
                        self.columns[k], cell
                    ))?;
                }
            }
            if filled {
                affected += 1;
            }
        }
        ctx.affected(affected);
        Ok(batch)
    }
}
