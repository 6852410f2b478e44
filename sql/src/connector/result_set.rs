use crate::{Error, ErrorKind, Result, Value};
use std::ops::Index;
use std::sync::Arc;

/// Rows returned by a query, with shared column metadata.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    columns: Arc<Vec<String>>,
    rows: Vec<ResultRow>,
    last_insert_id: Option<i64>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, value_rows: Vec<Vec<Value>>) -> Self {
        let columns = Arc::new(columns);
        let rows = value_rows
            .into_iter()
            .map(|values| ResultRow {
                columns: Arc::clone(&columns),
                values,
            })
            .collect();

        Self {
            columns,
            rows,
            last_insert_id: None,
        }
    }

    pub fn with_last_insert_id(mut self, last_insert_id: Option<i64>) -> Self {
        self.last_insert_id = last_insert_id;
        self
    }

    pub fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ResultRow> {
        self.rows.get(index)
    }

    pub fn first(&self) -> Option<&ResultRow> {
        self.rows.first()
    }

    /// Consumes the set expecting exactly one row.
    pub fn into_single(mut self) -> Result<ResultRow> {
        if self.rows.len() != 1 {
            return Err(Error::new(ErrorKind::NotSingleRow(self.rows.len())));
        }
        Ok(self.rows.remove(0))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResultRow> {
        self.rows.iter()
    }
}

impl IntoIterator for ResultSet {
    type Item = ResultRow;
    type IntoIter = std::vec::IntoIter<ResultRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// One row, indexable by column name or position.
#[derive(Debug, Clone)]
pub struct ResultRow {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl ResultRow {
    pub fn get(&self, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)
    }

    pub fn at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The row as an ordered JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for (column, value) in self.columns.iter().zip(&self.values) {
            object.insert(column.clone(), value.to_json());
        }
        serde_json::Value::Object(object)
    }
}

impl Index<&str> for ResultRow {
    type Output = Value;

    fn index(&self, column: &str) -> &Self::Output {
        self.get(column)
            .unwrap_or_else(|| panic!("no column `{column}` in result row"))
    }
}

impl Index<usize> for ResultRow {
    type Output = Value;

    fn index(&self, index: usize) -> &Self::Output {
        &self.values[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexing_by_name_and_position() {
        let set = ResultSet::new(
            vec!["id".to_owned(), "email".to_owned()],
            vec![vec![Value::int32(1), Value::text("a@x")]],
        );

        let row = set.first().unwrap();
        assert_eq!(row["id"], Value::int32(1));
        assert_eq!(row[1], Value::text("a@x"));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn into_single_is_strict() {
        let empty = ResultSet::new(vec!["id".to_owned()], vec![]);
        assert!(empty.into_single().is_err());

        let two = ResultSet::new(
            vec!["id".to_owned()],
            vec![vec![Value::int32(1)], vec![Value::int32(2)]],
        );
        assert!(two.into_single().is_err());
    }

    #[test]
    fn row_to_json_keeps_column_order() {
        let set = ResultSet::new(
            vec!["b".to_owned(), "a".to_owned()],
            vec![vec![Value::int32(1), Value::int32(2)]],
        );
        let json = set.first().unwrap().to_json();
        assert_eq!(serde_json::to_string(&json).unwrap(), r#"{"b":1,"a":2}"#);
    }
}
