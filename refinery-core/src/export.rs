//! Code Exporter: render a pipeline as deterministic source text.
//!
//! Two targets are supported. `Pandas` emits a standalone Python script that
//! reproduces every step with pandas. `Script` emits the Refinery text format,
//! which [`import_script`] parses back into a pipeline.
//!
//! Output depends only on step types and parameters, in order. Step ids and
//! the source version are left out so identical edits export identically.

use crate::error::{RefineryError, Result};
use crate::pipeline::{Params, Pipeline, TransformationStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// First line of every Refinery script.
pub const SCRIPT_HEADER: &str = "refinery-script v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportTarget {
    #[default]
    Pandas,
    Script,
}

impl FromStr for ExportTarget {
    type Err = RefineryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pandas" | "python" => Ok(ExportTarget::Pandas),
            "script" | "refinery" => Ok(ExportTarget::Script),
            other => Err(RefineryError::invalid(format!(
                "unknown export target '{other}' (expected pandas or script)"
            ))),
        }
    }
}

/// Render `pipeline` for `target`.
pub fn export(pipeline: &Pipeline, target: ExportTarget) -> String {
    match target {
        ExportTarget::Pandas => export_pandas(pipeline),
        ExportTarget::Script => export_script(pipeline),
    }
}

// ---------------------------------------------------------------------------
// Refinery script
// ---------------------------------------------------------------------------

fn export_script(pipeline: &Pipeline) -> String {
    let mut out = format!("{SCRIPT_HEADER}\n# pipeline {}\n", pipeline.content_hash());
    for step in &pipeline.steps {
        out.push_str("step ");
        out.push_str(&step.type_id);
        for (name, value) in &step.params {
            out.push_str(&format!(" {name}={value}"));
        }
        out.push('\n');
    }
    out
}

/// Parse a Refinery script into a pipeline over `source_version`.
///
/// Blank lines and `#` comments are ignored. Each `step` line holds a type
/// id followed by `name=<json>` pairs.
pub fn import_script(text: &str, source_version: &str) -> Result<Pipeline> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'));

    match lines.next() {
        Some((_, SCRIPT_HEADER)) => {}
        Some((n, other)) => {
            return Err(RefineryError::invalid(format!(
                "line {n}: expected '{SCRIPT_HEADER}', found '{other}'"
            )));
        }
        None => return Err(RefineryError::invalid("empty script")),
    }

    let mut steps = Vec::new();
    for (n, line) in lines {
        let rest = line.strip_prefix("step ").ok_or_else(|| {
            RefineryError::invalid(format!("line {n}: expected 'step <type> ...'"))
        })?;
        let step = parse_step(rest.trim_start())
            .map_err(|e| RefineryError::invalid(format!("line {n}: {e}")))?;
        steps.push(step);
    }
    Ok(Pipeline::from_steps(source_version, steps))
}

fn parse_step(line: &str) -> std::result::Result<TransformationStep, String> {
    let (type_id, mut rest) = match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    };
    if type_id.is_empty() {
        return Err("missing transformation type".to_string());
    }

    let mut params = Params::new();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("expected name=value, found '{rest}'"))?;
        let name = &rest[..eq];
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(format!("bad parameter name '{name}'"));
        }
        let mut values = serde_json::Deserializer::from_str(&rest[eq + 1..]).into_iter::<Value>();
        let value = match values.next() {
            Some(Ok(value)) => value,
            Some(Err(e)) => return Err(format!("parameter '{name}': {e}")),
            None => return Err(format!("parameter '{name}' has no value")),
        };
        let consumed = eq + 1 + values.byte_offset();
        if params.insert(name.to_string(), value).is_some() {
            return Err(format!("parameter '{name}' given twice"));
        }
        rest = rest[consumed..].trim_start();
    }

    let mut step = TransformationStep::new(type_id, Value::Null);
    step.params = params;
    Ok(step)
}

// ---------------------------------------------------------------------------
// pandas
// ---------------------------------------------------------------------------

const PANDAS_PRELUDE: &str = r#"import json
import math
import re
import sys
from datetime import datetime, timezone

import pandas as pd

# Every column holds plain Python values (dtype=object) so nulls, integers,
# and mixed cells keep their JSON types through each step.

_DATETIME_LAYOUTS = ("%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S")
_DATE_LAYOUTS = ("%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y")
_TRUE = {"true", "yes", "y", "t", "1"}
_FALSE = {"false", "no", "n", "f", "0"}


def _is_missing(value):
    return value is None or (isinstance(value, float) and math.isnan(value))


def _is_number(value):
    return isinstance(value, (int, float)) and not isinstance(value, bool) and not _is_missing(value)


def _finite(value):
    return value if math.isfinite(value) else None


def _label(value):
    if isinstance(value, str):
        return value
    return json.dumps(value, separators=(",", ":"), ensure_ascii=False)


def _set(df, col, values):
    df[col] = pd.Series(list(values), index=df.index, dtype=object)


def _keep_rows(df, keep):
    return df.loc[list(keep)].reset_index(drop=True)


def _text_columns(df):
    return [c for c in df.columns if all(_is_missing(v) or isinstance(v, str) for v in df[c])]


def _map_text(df, columns, fn):
    for col in columns:
        _set(df, col, (fn(v) if isinstance(v, str) else v for v in df[col]))


def _title(text):
    out, in_word = [], False
    for ch in text:
        if ch.isalpha():
            out.append(ch.lower() if in_word else ch.upper())
            in_word = True
        else:
            out.append(ch)
            in_word = False
    return "".join(out)


def _strip_special(text):
    return "".join(ch for ch in text if ch.isalpha() or ch.isdecimal() or ch.isspace())


def _remove_duplicates(df, columns, keep):
    keys = [json.dumps([df.at[i, c] for c in columns]) for i in df.index]
    return _keep_rows(df, ~pd.Series(keys, dtype=object).duplicated(keep=keep))


def _drop_missing(df, columns, how):
    test = all if how == "all" else any
    return _keep_rows(
        df, (not (columns and test(_is_missing(df.at[i, c]) for c in columns)) for i in df.index)
    )


def _propagate(values):
    last, out = None, []
    for v in values:
        if _is_missing(v):
            out.append(last)
        else:
            last = v
            out.append(v)
    return out


def _mean(numbers):
    return _finite(sum(float(v) for v in numbers) / len(numbers))


def _median(numbers):
    ordered = sorted(float(v) for v in numbers)
    mid = len(ordered) // 2
    if len(ordered) % 2 == 0:
        return _finite((ordered[mid - 1] + ordered[mid]) / 2)
    return ordered[mid]


def _mode(numbers):
    counts = {}
    for v in numbers:
        key = json.dumps(v)
        first, count = counts.get(key, (v, 0))
        counts[key] = (first, count + 1)
    best = max(count for _, count in counts.values())
    return min(v for v, count in counts.values() if count == best)


def _require_numbers(col, values):
    for v in values:
        if not _is_missing(v) and not _is_number(v):
            raise ValueError(f"column {col!r}: non-numeric value {v!r}")


def _fill_statistic(df, col, stat):
    values = list(df[col])
    _require_numbers(col, values)
    numbers = [v for v in values if _is_number(v)]
    fill = stat(numbers) if numbers else None
    keep_type = stat is _mode
    _set(df, col, (fill if _is_missing(v) else v if keep_type else float(v) for v in values))


def _parse_datetime(value):
    if not isinstance(value, str):
        return None
    text = value.strip()
    if re.search(r"[Tt ]\d{2}:\d{2}:\d{2}(\.\d+)?([Zz]|[+-]\d{2}:\d{2})$", text):
        if text[-1] in "Zz":
            text = text[:-1] + "+00:00"
        try:
            parsed = datetime.fromisoformat(text)
            return parsed.astimezone(timezone.utc).replace(tzinfo=None)
        except ValueError:
            pass
    for layout in _DATETIME_LAYOUTS + _DATE_LAYOUTS:
        try:
            return datetime.strptime(text, layout)
        except ValueError:
            continue
    return None


def _to_numeric(value):
    if isinstance(value, bool):
        return int(value)
    if _is_number(value):
        return value
    if isinstance(value, str):
        text = value.strip()
        if not text.isascii() or "_" in text:
            return None
        try:
            parsed = int(text)
            if -(2**63) <= parsed < 2**63:
                return parsed
        except ValueError:
            pass
        try:
            return _finite(float(text))
        except ValueError:
            return None
    return None


def _to_string(value):
    return _label(value)


def _to_datetime(value):
    parsed = _parse_datetime(value)
    return parsed.strftime("%Y-%m-%dT%H:%M:%S") if parsed is not None else None


def _to_boolean(value):
    if isinstance(value, bool):
        return value
    if _is_number(value):
        return {1: True, 0: False}.get(value)
    if isinstance(value, str):
        text = value.strip().lower()
        if text in _TRUE:
            return True
        if text in _FALSE:
            return False
    return None


def _convert(df, col, fn):
    _set(df, col, (None if _is_missing(v) else fn(v) for v in df[col]))


def _one_hot(df, col):
    labels = [None if _is_missing(v) else _label(v) for v in df[col]]
    df = df.drop(columns=[col])
    for category in sorted({label for label in labels if label is not None}):
        _set(df, f"{col}_{category}", (int(label == category) for label in labels))
    return df


def _label_encode(values):
    codes = {}
    return [None if _is_missing(v) else codes.setdefault(_label(v), len(codes)) for v in values]


def _date_parts(df, col):
    parsed = [_parse_datetime(v) for v in df[col]]
    _set(df, f"{col}_year", (None if d is None else d.year for d in parsed))
    _set(df, f"{col}_month", (None if d is None else d.month for d in parsed))
    _set(df, f"{col}_day", (None if d is None else d.day for d in parsed))
    _set(df, f"{col}_dayofweek", (None if d is None else d.weekday() for d in parsed))


def _bin(value, low, high, bins):
    width = (high - low) / bins
    if width <= 0:
        return 0
    edge = lambda k: low + (high - low) * k / bins
    idx = min(max(math.floor((value - low) / width), 0), bins - 1)
    while idx < bins - 1 and value >= edge(idx + 1):
        idx += 1
    while idx > 0 and value < edge(idx):
        idx -= 1
    return idx


def _create_bins(df, col, bins):
    values = list(df[col])
    _require_numbers(col, values)
    numbers = [float(v) for v in values if _is_number(v)]
    low, high = (min(numbers), max(numbers)) if numbers else (0.0, 0.0)
    _set(df, f"{col}_bin", (_bin(float(v), low, high, bins) if _is_number(v) else None for v in values))


def _read(path):
    with open(path, encoding="utf-8") as handle:
        text = handle.read()
    if text.lstrip().startswith("["):
        records = json.loads(text)
    else:
        records = [json.loads(line) for line in text.splitlines() if line.strip()]
    columns = []
    for record in records:
        for key in sorted(record):
            if key not in columns:
                columns.append(key)
    return pd.DataFrame(
        {c: pd.Series([r.get(c) for r in records], dtype=object) for c in columns},
        columns=columns,
    )


def _jsonable(value):
    if _is_missing(value):
        return None
    if hasattr(value, "item"):
        return value.item()
    return value
"#;

const PANDAS_MAIN: &str = r#"

if __name__ == "__main__":
    result = transform(_read(sys.argv[1]))
    for row in result.itertuples(index=False, name=None):
        record = {c: _jsonable(v) for c, v in zip(result.columns, row)}
        sys.stdout.write(json.dumps(record, ensure_ascii=False) + "\n")
"#;

fn export_pandas(pipeline: &Pipeline) -> String {
    let mut out = String::new();
    out.push_str("# Generated by refinery. Do not edit by hand.\n");
    out.push_str(&format!("# pipeline {}\n", pipeline.content_hash()));
    out.push_str(PANDAS_PRELUDE);
    out.push_str("\n\ndef transform(df: pd.DataFrame) -> pd.DataFrame:\n");
    out.push_str("    df = df.copy()\n");
    for step in &pipeline.steps {
        out.push_str(&format!("\n    # step {}: {}", step.order, step.type_id));
        if !step.params.is_empty() {
            let rendered: Vec<String> = step
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            out.push_str(&format!(" ({})", rendered.join(", ")));
        }
        out.push('\n');
        for line in pandas_step(step) {
            out.push_str("    ");
            out.push_str(&line);
            out.push('\n');
        }
    }
    out.push_str("\n    return df\n");
    out.push_str(PANDAS_MAIN);
    out
}

/// A Python string literal. JSON string escapes are valid Python escapes.
fn py_str(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

fn py_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| py_str(s)).collect();
    format!("[{}]", quoted.join(", "))
}

fn str_param<'a>(step: &'a TransformationStep, name: &str, default: &'a str) -> &'a str {
    step.param(name).and_then(Value::as_str).unwrap_or(default)
}

fn list_param(step: &TransformationStep, name: &str) -> Option<Vec<String>> {
    step.param(name)?.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

/// Python expression for the targeted columns, with `fallback` when the
/// list parameter is absent.
fn columns_expr(step: &TransformationStep, name: &str, fallback: &str) -> String {
    list_param(step, name)
        .map(|cols| py_list(&cols))
        .unwrap_or_else(|| fallback.to_string())
}

fn pandas_step(step: &TransformationStep) -> Vec<String> {
    let text_cols = || columns_expr(step, "columns", "_text_columns(df)");
    let all_cols = |name: &str| columns_expr(step, name, "list(df.columns)");
    let required_cols = || columns_expr(step, "columns", "[]");
    let per_column = |body: &str| {
        vec![
            format!("for col in {}:", required_cols()),
            format!("    {body}"),
        ]
    };

    match step.type_id.as_str() {
        "remove_duplicates" => vec![format!(
            "df = _remove_duplicates(df, {}, {})",
            all_cols("subset"),
            py_str(str_param(step, "keep", "first"))
        )],
        "trim_whitespace" => vec![format!("_map_text(df, {}, str.strip)", text_cols())],
        "fix_casing" => {
            let func = match str_param(step, "case", "lower") {
                "upper" => "str.upper",
                "title" => "_title",
                _ => "str.lower",
            };
            vec![format!("_map_text(df, {}, {func})", text_cols())]
        }
        "remove_special_chars" => {
            vec![format!("_map_text(df, {}, _strip_special)", text_cols())]
        }
        "drop_missing" => vec![format!(
            "df = _drop_missing(df, {}, {})",
            all_cols("columns"),
            py_str(str_param(step, "how", "any"))
        )],
        "fill_forward" => vec![
            format!("for col in {}:", all_cols("columns")),
            "    _set(df, col, _propagate(df[col]))".to_string(),
        ],
        "fill_backward" => vec![
            format!("for col in {}:", all_cols("columns")),
            "    _set(df, col, reversed(_propagate(reversed(list(df[col])))))".to_string(),
        ],
        "fill_mean" => per_column("_fill_statistic(df, col, _mean)"),
        "fill_median" => per_column("_fill_statistic(df, col, _median)"),
        "fill_mode" => per_column("_fill_statistic(df, col, _mode)"),
        "to_numeric" | "to_string" | "to_datetime" | "to_boolean" => {
            per_column(&format!("_convert(df, col, _{})", step.type_id))
        }
        "one_hot_encode" => per_column("df = _one_hot(df, col)"),
        "label_encode" => per_column("_set(df, col, _label_encode(df[col]))"),
        "extract_date_parts" => per_column("_date_parts(df, col)"),
        "create_bins" => {
            let column = py_str(str_param(step, "column", ""));
            let bins = step.param("bins").and_then(Value::as_i64).unwrap_or(5).max(2);
            vec![format!("_create_bins(df, {column}, {bins})")]
        }
        other => vec![format!(
            "raise NotImplementedError({})",
            py_str(&format!("transformation type '{other}'"))
        )],
    }
}
