//! Type conversion transformations. Values that cannot be converted become
//! null and are counted as coercion failures.

use crate::data::batch::DataBatch;
use crate::data::schema::{ColumnType, SchemaDefinition};
use crate::data::value;
use crate::error::Result;
use crate::transform::kernel::{column_indices, Kernel, StepContext};
use crate::transform::params::{ParamKind, ParamSpec};
use crate::transform::registry::{
    Applicability, BuiltinTransformation, Category, KernelFn, SchemaFn, Targets,
};
use serde_json::Value;

const CONVERT_PARAMS: &[ParamSpec] = &[ParamSpec::required(
    "columns",
    ParamKind::Columns,
    "Columns to convert",
)];

type Converter = fn(&Value) -> Option<Value>;

fn conversion(
    id: &'static str,
    description: &'static str,
    schema: SchemaFn,
    kernel: KernelFn,
) -> BuiltinTransformation {
    BuiltinTransformation {
        id,
        category: Category::TypeConversion,
        description,
        params: CONVERT_PARAMS,
        applicability: Applicability::Any,
        targets: Targets::Columns("columns"),
        schema,
        kernel,
    }
}

pub(crate) fn definitions() -> Vec<BuiltinTransformation> {
    vec![
        conversion(
            "to_numeric",
            "Convert values to numbers",
            |_, t, s| retype(t, s, ColumnType::Float),
            |_, c| Ok(Box::new(Convert::new(c, "numeric", to_numeric))),
        ),
        conversion(
            "to_string",
            "Convert values to text",
            |_, t, s| retype(t, s, ColumnType::String),
            |_, c| Ok(Box::new(Convert::new(c, "string", to_string))),
        ),
        conversion(
            "to_datetime",
            "Parse values as datetimes",
            |_, t, s| retype(t, s, ColumnType::DateTime),
            |_, c| Ok(Box::new(Convert::new(c, "datetime", to_datetime))),
        ),
        conversion(
            "to_boolean",
            "Convert values to booleans",
            |_, t, s| retype(t, s, ColumnType::Boolean),
            |_, c| Ok(Box::new(Convert::new(c, "boolean", to_boolean))),
        ),
    ]
}

fn retype(targets: &[String], input: &SchemaDefinition, dtype: ColumnType) -> SchemaDefinition {
    let mut schema = input.clone();
    for name in targets {
        schema.set_type(name, dtype);
        schema.set_nullable(name, true);
    }
    schema
}

pub fn to_numeric(cell: &Value) -> Option<Value> {
    match cell {
        Value::Number(_) => Some(cell.clone()),
        Value::Bool(b) => Some(Value::from(i64::from(*b))),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(Value::from(i));
            }
            s.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(value::float)
        }
        _ => None,
    }
}

pub fn to_string(cell: &Value) -> Option<Value> {
    match cell {
        Value::String(_) => Some(cell.clone()),
        other => Some(Value::String(value::label(other))),
    }
}

pub fn to_datetime(cell: &Value) -> Option<Value> {
    value::as_datetime(cell)
        .map(|dt| Value::String(dt.format(value::DATETIME_FORMAT).to_string()))
}

pub fn to_boolean(cell: &Value) -> Option<Value> {
    match cell {
        Value::Bool(_) => Some(cell.clone()),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x == 1.0 => Some(Value::Bool(true)),
            Some(x) if x == 0.0 => Some(Value::Bool(false)),
            _ => None,
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "t" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "n" | "f" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

struct Convert {
    columns: Vec<String>,
    target: &'static str,
    convert: Converter,
}

impl Convert {
    fn new(columns: Vec<String>, target: &'static str, convert: Converter) -> Self {
        Self {
            columns,
            target,
            convert,
        }
    }
}

impl Kernel for Convert {
    fn process(&mut self, mut batch: DataBatch, ctx: &mut StepContext) -> Result<DataBatch> {
        let idx = column_indices(&batch, &self.columns)?;
        let mut affected = 0;
        for row in &mut batch.rows {
            let mut changed = false;
            for (k, &i) in idx.iter().enumerate() {
                if row[i].is_null() {
                    continue;
                }
                match (self.convert)(&row[i]) {
                    Some(converted) => {
                        if converted != row[i] {
                            row[i] = converted;
                            changed = true;
                        }
                    }
                    None => {
                        row[i] = Value::Null;
                        changed = true;
                        ctx.coerced(1);
                        ctx.warn(format!(
                            "column '{}': some values could not be converted to {}",
                            self.columns[k], self.target
                        ));
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
