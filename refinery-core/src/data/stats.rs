//! Statistics collaborator: per-column summaries used for version snapshots
//! and preview diagnostics.

use crate::data::batch::DataBatch;
use crate::data::schema::{ColumnType, SchemaDefinition};
use crate::data::value;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Dataset-level statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub row_count: usize,
    pub columns: Vec<ColumnStats>,
}

impl DatasetStats {
    pub fn column(&self, name: &str) -> Option<&ColumnStats> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Statistics for a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub name: String,
    pub dtype: ColumnType,
    pub count: usize,
    pub missing: usize,
    pub unique: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categorical: Option<CategoricalSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalSummary {
    pub top: String,
    pub top_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub min: String,
    pub max: String,
}

/// Incremental statistics over a chunk stream.
pub trait StatsAccumulator: Send {
    fn observe(&mut self, batch: &DataBatch);
    fn finish(self: Box<Self>) -> DatasetStats;
}

/// The statistics collaborator consumed by the engines and dataset stores.
pub trait StatsProvider: Send + Sync {
    fn accumulator(&self, schema: &SchemaDefinition) -> Box<dyn StatsAccumulator>;

    fn compute_stats(&self, batch: &DataBatch, schema: &SchemaDefinition) -> DatasetStats {
        let mut acc = self.accumulator(schema);
        acc.observe(batch);
        acc.finish()
    }
}

/// Default statistics implementation. Exact: distinct counts are kept in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicStats;

impl StatsProvider for BasicStats {
    fn accumulator(&self, schema: &SchemaDefinition) -> Box<dyn StatsAccumulator> {
        Box::new(BasicAccumulator {
            rows: 0,
            columns: schema
                .columns
                .iter()
                .map(|c| ColumnAccumulator::new(&c.name, c.dtype))
                .collect(),
        })
    }
}

struct BasicAccumulator {
    rows: usize,
    columns: Vec<ColumnAccumulator>,
}

struct ColumnAccumulator {
    name: String,
    dtype: ColumnType,
    count: usize,
    missing: usize,
    distinct: HashSet<String>,
    frequencies: BTreeMap<String, usize>,
    numeric_n: usize,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
    dt_min: Option<chrono::NaiveDateTime>,
    dt_max: Option<chrono::NaiveDateTime>,
}

impl ColumnAccumulator {
    fn new(name: &str, dtype: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            count: 0,
            missing: 0,
            distinct: HashSet::new(),
            frequencies: BTreeMap::new(),
            numeric_n: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            dt_min: None,
            dt_max: None,
        }
    }

    fn observe(&mut self, cell: &Value) {
        if cell.is_null() {
            self.missing += 1;
            return;
        }
        self.count += 1;
        self.distinct.insert(value::row_key([cell]));

        if self.dtype.is_numeric() {
            if let Some(x) = value::as_f64(cell) {
                self.numeric_n += 1;
                self.sum += x;
                self.sum_sq += x * x;
                self.min = self.min.min(x);
                self.max = self.max.max(x);
            }
        } else if self.dtype == ColumnType::DateTime {
            if let Some(dt) = value::as_datetime(cell) {
                self.dt_min = Some(self.dt_min.map_or(dt, |m| m.min(dt)));
                self.dt_max = Some(self.dt_max.map_or(dt, |m| m.max(dt)));
            }
        } else {
            *self.frequencies.entry(value::label(cell)).or_insert(0) += 1;
        }
    }

    fn finish(self) -> ColumnStats {
        let numeric = (self.numeric_n > 0).then(|| {
            let n = self.numeric_n as f64;
            let mean = self.sum / n;
            let variance = (self.sum_sq / n - mean * mean).max(0.0);
            NumericSummary {
                min: self.min,
                max: self.max,
                mean,
                std_dev: variance.sqrt(),
            }
        });
        // Highest frequency wins; ties go to the lexicographically first label.
        let categorical = self
            .frequencies
            .iter()
            .fold(None::<(&String, usize)>, |best, (label, &n)| match best {
                Some((_, best_n)) if best_n >= n => best,
                _ => Some((label, n)),
            })
            .map(|(top, top_count)| CategoricalSummary {
                top: top.clone(),
                top_count,
            });
        let datetime = match (self.dt_min, self.dt_max) {
            (Some(min), Some(max)) => Some(DateRange {
                min: min.format(value::DATETIME_FORMAT).to_string(),
                max: max.format(value::DATETIME_FORMAT).to_string(),
            }),
            _ => None,
        };
        ColumnStats {
            name: self.name,
            dtype: self.dtype,
            count: self.count,
            missing: self.missing,
            unique: self.distinct.len(),
            numeric,
            categorical,
            datetime,
        }
    }
}

impl StatsAccumulator for BasicAccumulator {
    fn observe(&mut self, batch: &DataBatch) {
        self.rows += batch.row_count();
        for col in &mut self.columns {
            let Some(idx) = batch.column_index(&col.name) else {
                continue;
            };
            for cell in batch.column_values(idx) {
                col.observe(cell);
            }
        }
    }

    fn finish(self: Box<Self>) -> DatasetStats {
        let this = *self;
        DatasetStats {
            row_count: this.rows,
            columns: this.columns.into_iter().map(ColumnAccumulator::finish).collect(),
        }
    }
}
