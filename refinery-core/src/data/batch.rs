//! Row batches: the unit of data every transformation consumes and produces.

use crate::error::{RefineryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

static NULL: Value = Value::Null;

/// A batch of data rows. Each row is aligned with `columns`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl DataBatch {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// An empty batch with the given column layout.
    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a batch from JSON objects. Column order follows first appearance;
    /// keys missing from a record become null.
    pub fn from_records(records: &[Value]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            let obj = record.as_object().ok_or_else(|| {
                RefineryError::execution(format!("expected a JSON object per row, got {record}"))
            })?;
            for key in obj.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Ok(Self { columns, rows })
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let obj: serde_json::Map<String, Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(obj)
            })
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Like [`column_index`](Self::column_index) but fails with an execution error.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| RefineryError::execution(format!("column '{name}' not present in data")))
    }

    /// Iterate over the values of one column.
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().map(move |row| row.get(idx).unwrap_or(&NULL))
    }

    /// Append the rows of `other`. Column layouts must match.
    pub fn extend(&mut self, other: DataBatch) -> Result<()> {
        if other.rows.is_empty() {
            return Ok(());
        }
        if self.columns != other.columns {
            if self.rows.is_empty() {
                *self = other;
                return Ok(());
            }
            return Err(RefineryError::execution(format!(
                "cannot concatenate batches with different columns: {:?} vs {:?}",
                self.columns, other.columns
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Remove a column and its values.
    pub fn drop_column(&mut self, idx: usize) {
        if idx >= self.columns.len() {
            return;
        }
        self.columns.remove(idx);
        for row in &mut self.rows {
            if idx < row.len() {
                row.remove(idx);
            }
        }
    }

    /// Append a column, replacing an existing one of the same name.
    pub fn put_column(&mut self, name: &str, values: Vec<Value>) {
        match self.column_index(name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
    }

    /// Keep the first `limit` rows.
    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    /// Split into consecutive batches of at most `size` rows.
    pub fn into_chunks(self, size: usize) -> Vec<DataBatch> {
        let size = size.max(1);
        let columns = self.columns;
        let mut chunks = Vec::new();
        let mut rows = self.rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<Vec<Value>> = rows.by_ref().take(size).collect();
            chunks.push(DataBatch::new(columns.clone(), chunk));
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_records_fills_missing_keys() {
        let batch =
            DataBatch::from_records(&[json!({"id": 1, "name": "A"}), json!({"id": 2})]).unwrap();
        assert_eq!(batch.columns, vec!["id", "name"]);
        assert_eq!(batch.rows[1], vec![json!(2), Value::Null]);
        assert_eq!(batch.to_records()[0], json!({"id": 1, "name": "A"}));
    }

    #[test]
    fn test_from_records_rejects_non_objects() {
        assert!(DataBatch::from_records(&[json!([1, 2])]).is_err());
    }

    #[test]
    fn test_drop_and_put_column() {
        let mut batch = DataBatch::new(
            vec!["a".into(), "b".into()],
            vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)]],
        );
        batch.drop_column(0);
        assert_eq!(batch.columns, vec!["b"]);
        batch.put_column("c", vec![json!("x"), json!("y")]);
        batch.put_column("b", vec![json!(0), json!(0)]);
        assert_eq!(batch.rows, vec![vec![json!(0), json!("x")], vec![json!(0), json!("y")]]);
    }

    #[test]
    fn test_into_chunks() {
        let rows = (0..5).map(|i| vec![json!(i)]).collect();
        let chunks = DataBatch::new(vec!["n".into()], rows).into_chunks(2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].rows, vec![vec![json!(4)]]);
    }

    #[test]
    fn test_extend_mismatched_columns() {
        let mut a = DataBatch::new(vec!["a".into()], vec![vec![json!(1)]]);
        let b = DataBatch::new(vec!["b".into()], vec![vec![json!(2)]]);
        assert!(a.extend(b).is_err());

        let mut empty = DataBatch::empty(vec!["a".into()]);
        empty
            .extend(DataBatch::new(vec!["z".into()], vec![vec![json!(1)]]))
            .unwrap();
        assert_eq!(empty.columns, vec!["z"]);
    }
}
