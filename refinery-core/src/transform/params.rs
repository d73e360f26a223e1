//! Parameter schemas and checking.

use crate::error::Violation;
use crate::pipeline::Params;
use serde::Serialize;
use serde_json::Value;

/// The accepted shape of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
    },
    Boolean,
    /// A single column name.
    Column,
    /// A non-empty list of distinct column names.
    Columns,
    /// One of a fixed set of strings.
    Choice { options: &'static [&'static str] },
}

/// Default value of an optional parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamDefault {
    Str(&'static str),
    Int(i64),
    Bool(bool),
}

impl ParamDefault {
    pub fn to_value(self) -> Value {
        match self {
            ParamDefault::Str(s) => Value::String(s.to_string()),
            ParamDefault::Int(i) => Value::from(i),
            ParamDefault::Bool(b) => Value::Bool(b),
        }
    }
}

/// Declaration of one parameter of a transformation type.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    #[serde(flatten)]
    pub kind: ParamKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamDefault>,
    pub description: &'static str,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
            description,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
            description,
        }
    }

    pub const fn with_default(
        name: &'static str,
        kind: ParamKind,
        default: ParamDefault,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: Some(default),
            description,
        }
    }
}

/// Check `params` against `specs`, returning every violated constraint.
pub fn check_params(specs: &[ParamSpec], params: &Params) -> Vec<Violation> {
    let mut violations = Vec::new();

    for name in params.keys() {
        if !specs.iter().any(|s| s.name == name) {
            violations.push(Violation::new(name.as_str(), "unknown parameter"));
        }
    }

    for spec in specs {
        match params.get(spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    violations.push(Violation::new(spec.name, "required parameter is missing"));
                }
            }
            Some(value) => {
                if let Some(message) = check_kind(spec.kind, value) {
                    violations.push(Violation::new(spec.name, message));
                }
            }
        }
    }

    violations
}

fn check_kind(kind: ParamKind, value: &Value) -> Option<String> {
    match kind {
        ParamKind::String => (!value.is_string()).then(|| format!("expected a string, got {value}")),
        ParamKind::Boolean => (!value.is_boolean()).then(|| format!("expected a boolean, got {value}")),
        ParamKind::Integer { min } => match value.as_i64() {
            None => Some(format!("expected an integer, got {value}")),
            Some(n) => match min {
                Some(min) if n < min => Some(format!("must be >= {min}, got {n}")),
                _ => None,
            },
        },
        ParamKind::Column => match value.as_str() {
            Some(s) if !s.is_empty() => None,
            _ => Some(format!("expected a column name, got {value}")),
        },
        ParamKind::Columns => {
            let Some(items) = value.as_array() else {
                return Some(format!("expected a list of column names, got {value}"));
            };
            if items.is_empty() {
                return Some("column list must not be empty".to_string());
            }
            let mut seen = Vec::new();
            for item in items {
                match item.as_str() {
                    Some(s) if !s.is_empty() => {
                        if seen.contains(&s) {
                            return Some(format!("column '{s}' listed more than once"));
                        }
                        seen.push(s);
                    }
                    _ => return Some(format!("expected a column name, got {item}")),
                }
            }
            None
        }
        ParamKind::Choice { options } => match value.as_str() {
            Some(s) if options.contains(&s) => None,
            _ => Some(format!("expected one of {options:?}, got {value}")),
        },
    }
}

/// Typed accessors over checked parameters, applying declared defaults.
pub struct ParamReader<'a> {
    specs: &'a [ParamSpec],
    params: &'a Params,
}

impl<'a> ParamReader<'a> {
    pub fn new(specs: &'a [ParamSpec], params: &'a Params) -> Self {
        Self { specs, params }
    }

    fn raw(&self, name: &str) -> Option<Value> {
        match self.params.get(name) {
            Some(Value::Null) | None => self
                .specs
                .iter()
                .find(|s| s.name == name)
                .and_then(|s| s.default)
                .map(ParamDefault::to_value),
            Some(v) => Some(v.clone()),
        }
    }

    pub fn string(&self, name: &str) -> Option<String> {
        self.raw(name).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.raw(name).and_then(|v| v.as_i64())
    }

    pub fn columns(&self, name: &str) -> Option<Vec<String>> {
        self.raw(name).and_then(|v| {
            v.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SPECS: &[ParamSpec] = &[
        ParamSpec::required("column", ParamKind::Column, "column to bin"),
        ParamSpec::with_default(
            "bins",
            ParamKind::Integer { min: Some(2) },
            ParamDefault::Int(5),
            "number of bins",
        ),
        ParamSpec::with_default(
            "keep",
            ParamKind::Choice {
                options: &["first", "last"],
            },
            ParamDefault::Str("first"),
            "which duplicate to keep",
        ),
        ParamSpec::optional("columns", ParamKind::Columns, "columns"),
    ];

    fn params(value: Value) -> Params {
        value.as_object().unwrap().clone().into_iter().collect()
    }

    #[test]
    fn test_collects_every_violation() {
        let violations = check_params(
            SPECS,
            &params(json!({"bins": 1, "keep": "middle", "columns": [], "extra": true})),
        );
        let targets: Vec<_> = violations
            .iter()
            .map(|v| v.target.clone().unwrap())
            .collect();
        assert_eq!(targets, vec!["extra", "column", "bins", "keep", "columns"]);
    }

    #[test]
    fn test_valid_params_pass() {
        let violations = check_params(SPECS, &params(json!({"column": "score", "bins": 2})));
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let violations = check_params(
            SPECS,
            &params(json!({"column": "a", "columns": ["x", "x"]})),
        );
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("more than once"));
    }

    #[test]
    fn test_reader_applies_defaults() {
        let p = params(json!({"column": "score"}));
        let reader = ParamReader::new(SPECS, &p);
        assert_eq!(reader.int("bins"), Some(5));
        assert_eq!(reader.string("keep").as_deref(), Some("first"));
        assert_eq!(reader.string("column").as_deref(), Some("score"));
        assert!(reader.columns("columns").is_none());
    }
}
