//! Cleaning transformations: duplicates, whitespace, casing, special characters.

use crate::data::batch::DataBatch;
use crate::data::value;
use crate::error::Result;
use crate::transform::kernel::{column_indices, Kernel, StepContext};
use crate::transform::params::{ParamDefault, ParamKind, ParamReader, ParamSpec};
use crate::transform::registry::{
    Applicability, BuiltinTransformation, Category, Targets,
};
use crate::transform::unchanged_schema;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Anything that is not a letter, a decimal digit, or whitespace, in any script.
static SPECIAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{Nd}\s]").expect("static pattern"));

pub(crate) const COLUMNS_OPTIONAL: ParamSpec = ParamSpec::optional(
    "columns",
    ParamKind::Columns,
    "Columns to target; defaults to every applicable column",
);

const REMOVE_DUPLICATES_PARAMS: &[ParamSpec] = &[
    ParamSpec::optional(
        "subset",
        ParamKind::Columns,
        "Columns that define a duplicate; defaults to the full row",
    ),
    ParamSpec::with_default(
        "keep",
        ParamKind::Choice {
            options: &["first", "last"],
        },
        ParamDefault::Str("first"),
        "Which occurrence to keep",
    ),
];

const FIX_CASING_PARAMS: &[ParamSpec] = &[
    COLUMNS_OPTIONAL,
    ParamSpec::with_default(
        "case",
        ParamKind::Choice {
            options: &["lower", "upper", "title"],
        },
        ParamDefault::Str("lower"),
        "Target casing",
    ),
];

const TEXT_PARAMS: &[ParamSpec] = &[COLUMNS_OPTIONAL];

pub(crate) fn definitions() -> Vec<BuiltinTransformation> {
    vec![
        BuiltinTransformation {
            id: "remove_duplicates",
            category: Category::Cleaning,
            description: "Remove duplicate rows, comparing all columns or a subset",
            params: REMOVE_DUPLICATES_PARAMS,
            applicability: Applicability::Any,
            targets: Targets::ColumnsOrAll("subset"),
            schema: unchanged_schema,
            kernel: |params, columns| {
                let keep_last = params.string("keep").as_deref() == Some("last");
                Ok(Box::new(RemoveDuplicates::new(columns, keep_last)))
            },
        },
        BuiltinTransformation {
            id: "trim_whitespace",
            category: Category::Cleaning,
            description: "Strip leading and trailing whitespace from text",
            params: TEXT_PARAMS,
            applicability: Applicability::Text,
            targets: Targets::ColumnsOrAll("columns"),
            schema: unchanged_schema,
            kernel: |_, columns| Ok(Box::new(TextMap::new(columns, |s| s.trim().to_string()))),
        },
        BuiltinTransformation {
            id: "fix_casing",
            category: Category::Cleaning,
            description: "Normalize text casing to lower, upper, or title case",
            params: FIX_CASING_PARAMS,
            applicability: Applicability::Text,
            targets: Targets::ColumnsOrAll("columns"),
            schema: unchanged_schema,
            kernel: |params, columns| {
                let kernel = match params.string("case").as_deref() {
                    Some("upper") => TextMap::new(columns, |s| s.to_uppercase()),
                    Some("title") => TextMap::new(columns, title_case),
                    _ => TextMap::new(columns, |s| s.to_lowercase()),
                };
                Ok(Box::new(kernel))
            },
        },
        BuiltinTransformation {
            id: "remove_special_chars",
            category: Category::Cleaning,
            description: "Remove characters that are neither alphanumeric nor whitespace",
            params: TEXT_PARAMS,
            applicability: Applicability::Text,
            targets: Targets::ColumnsOrAll("columns"),
            schema: unchanged_schema,
            kernel: |_, columns| {
                Ok(Box::new(TextMap::new(columns, |s| {
                    SPECIAL_CHARS.replace_all(s, "").into_owned()
                })))
            },
        },
    ]
}

/// Title case: the first letter of every run of letters is upper-cased and
/// the rest lower-cased.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}

struct RemoveDuplicates {
    columns: Vec<String>,
    keep_last: bool,
    seen: HashSet<String>,
    last_position: HashMap<String, usize>,
    position: usize,
}

impl RemoveDuplicates {
    fn new(columns: Vec<String>, keep_last: bool) -> Self {
        Self {
            columns,
            keep_last,
            seen: HashSet::new(),
            last_position: HashMap::new(),
            position: 0,
        }
    }

    fn keys(&self, batch: &DataBatch) -> Result<Vec<String>> {
        let idx = column_indices(batch, &self.columns)?;
        Ok(batch
            .rows
            .iter()
            .map(|row| value::row_key(idx.iter().map(|&i| &row[i])))
            .collect())
    }
}

impl Kernel for RemoveDuplicates {
    fn needs_fit(&self) -> bool {
        self.keep_last
    }

    fn observe(&mut self, batch: &DataBatch, _ctx: &mut StepContext) -> Result<()> {
        for key in self.keys(batch)? {
            self.last_position.insert(key, self.position);
            self.position += 1;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.seen.clear();
        self.position = 0;
    }

    fn process(&mut self, batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let keys = self.keys(&batch)?;
        let before = batch.row_count();
        let DataBatch { columns, rows } = batch;
        let mut kept = Vec::with_capacity(rows.len());
        for (row, key) in rows.into_iter().zip(keys) {
            let keep = if self.keep_last {
                self.last_position.get(&key) == Some(&self.position)
            } else {
                self.seen.insert(key)
            };
            self.position += 1;
            if keep {
                kept.push(row);
            }
        }
        ctx.affected(before - kept.len());
        Ok(DataBatch::new(columns, kept))
    }
}

/// Applies a string function to every text cell of the target columns.
/// Non-string cells pass through untouched.
struct TextMap {
    columns: Vec<String>,
    map: fn(&str) -> String,
}

impl TextMap {
    fn new(columns: Vec<String>, map: fn(&str) -> String) -> Self {
        Self { columns, map }
    }
}

impl Kernel for TextMap {
    fn process(&mut self, mut batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let idx = column_indices(&batch, &self.columns)?;
        let mut affected = 0;
        for row in &mut batch.rows {
            let mut changed = false;
            for &i in &idx {
                if let Value::String(s) = &row[i] {
                    let mapped = (self.map)(s);
                    if mapped != *s {
                        row[i] = Value::String(mapped);
                        changed = true;
                    }
                }
            }
            if changed {
                affected += 1;
            }
        }
        ctx.affected(affected);
        Ok(batch)
    }
}
