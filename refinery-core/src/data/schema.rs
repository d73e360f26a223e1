//! Column types, schemas (materialized and symbolic), and type inference.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Boolean,
    DateTime,
    Json,
    Null,
    Unknown,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::String => "string",
            ColumnType::Boolean => "boolean",
            ColumnType::DateTime => "datetime",
            ColumnType::Json => "json",
            ColumnType::Null => "null",
            ColumnType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema definition for a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub columns: Vec<ColumnSchema>,
    /// Column families whose concrete names are only known after execution
    /// (e.g. one-hot outputs). Always empty on a materialized schema.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived: Vec<DerivedColumns>,
}

/// Schema for a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub dtype: ColumnType,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, dtype: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            dtype,
            nullable,
            description: None,
        }
    }
}

/// A family of columns named `{prefix}*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedColumns {
    pub prefix: String,
    pub dtype: ColumnType,
}

impl SchemaDefinition {
    pub fn new(columns: Vec<ColumnSchema>) -> Self {
        Self {
            columns,
            derived: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Resolve a column type, falling back to derived column families.
    pub fn resolve(&self, name: &str) -> Option<ColumnType> {
        if let Some(col) = self.column(name) {
            return Some(col.dtype);
        }
        self.derived
            .iter()
            .find(|d| name.starts_with(&d.prefix) && name.len() > d.prefix.len())
            .map(|d| d.dtype)
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Names of all concrete columns of the given types.
    pub fn names_of(&self, pred: impl Fn(ColumnType) -> bool) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| pred(c.dtype))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn set_type(&mut self, name: &str, dtype: ColumnType) {
        if let Some(col) = self.columns.iter_mut().find(|c| c.name == name) {
            col.dtype = dtype;
        }
    }

    pub fn set_nullable(&mut self, name: &str, nullable: bool) {
        if let Some(col) = self.columns.iter_mut().find(|c| c.name == name) {
            col.nullable = nullable;
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.columns.retain(|c| c.name != name);
    }

    /// Append a column, replacing an existing column of the same name in place.
    pub fn upsert(&mut self, column: ColumnSchema) {
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Type evidence carried by one cell; `None` for null.
fn cell_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ColumnType::Boolean),
        Value::Number(n) if n.is_f64() => Some(ColumnType::Float),
        Value::Number(_) => Some(ColumnType::Integer),
        Value::String(_) => Some(ColumnType::String),
        Value::Array(_) | Value::Object(_) => Some(ColumnType::Json),
    }
}

/// When the cells of a column disagree the widest type wins.
fn width(dtype: ColumnType) -> u8 {
    match dtype {
        ColumnType::Boolean => 1,
        ColumnType::Integer => 2,
        ColumnType::Float => 3,
        ColumnType::String => 4,
        ColumnType::Json => 5,
        _ => 0,
    }
}

/// The narrowest type that holds every non-null value; `Null` without evidence.
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = &'a Value>) -> ColumnType {
    values
        .into_iter()
        .filter_map(cell_type)
        .max_by_key(|dtype| width(*dtype))
        .unwrap_or(ColumnType::Null)
}

/// Infer a schema from column names and row-major cells.
pub fn infer_schema(columns: &[String], rows: &[Vec<Value>]) -> SchemaDefinition {
    let columns = columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let cells = || rows.iter().filter_map(move |row| row.get(i));
            ColumnSchema::new(
                name.clone(),
                infer_column_type(cells()),
                cells().any(Value::is_null),
            )
        })
        .collect();
    SchemaDefinition::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_widest_type_wins() {
        assert_eq!(infer_column_type(&[json!(1), json!(2)]), ColumnType::Integer);
        assert_eq!(infer_column_type(&[json!(1), json!(2.5)]), ColumnType::Float);
        assert_eq!(infer_column_type(&[json!(true), json!(0)]), ColumnType::Integer);
        assert_eq!(infer_column_type(&[json!(3), json!("x")]), ColumnType::String);
        assert_eq!(infer_column_type(&[json!("x"), json!([1])]), ColumnType::Json);
    }

    #[test]
    fn test_no_evidence_is_null() {
        assert_eq!(infer_column_type(&[Value::Null, Value::Null]), ColumnType::Null);
        assert_eq!(infer_column_type(&[]), ColumnType::Null);
    }

    #[test]
    fn test_infer_schema_marks_nullable() {
        let columns = vec!["city".to_string(), "visits".to_string()];
        let rows = vec![
            vec![json!("Pune"), json!(3)],
            vec![json!("Oslo"), Value::Null],
        ];
        let schema = infer_schema(&columns, &rows);
        assert_eq!(schema.names(), vec!["city", "visits"]);
        assert_eq!(schema.columns[0].dtype, ColumnType::String);
        assert_eq!(schema.columns[1].dtype, ColumnType::Integer);
        assert!(schema.columns[1].nullable);
        assert!(!schema.columns[0].nullable);
    }

    #[test]
    fn test_resolve_derived_prefix() {
        let mut schema = SchemaDefinition::new(vec![ColumnSchema::new(
            "id",
            ColumnType::Integer,
            false,
        )]);
        schema.derived.push(DerivedColumns {
            prefix: "color_".into(),
            dtype: ColumnType::Integer,
        });
        assert_eq!(schema.resolve("id"), Some(ColumnType::Integer));
        assert_eq!(schema.resolve("color_red"), Some(ColumnType::Integer));
        assert_eq!(schema.resolve("color_"), None);
        assert_eq!(schema.resolve("size"), None);
    }
}
