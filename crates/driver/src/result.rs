//! Statement results as returned by every backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row: field name → value, fields as projected by the statement.
pub type Row = Map<String, Value>;

/// Rows produced by a statement plus the returned/affected row count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Rows returned, or rows affected for DML without `RETURNING`.
    pub row_count: u64,
}

impl QueryResult {
    /// A result with no rows and a zero count (DDL, transaction markers).
    pub fn empty() -> Self {
        Self::default()
    }

    /// A result whose count is the number of rows returned.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self { rows, row_count }
    }

    /// A result for DML that reports only an affected count.
    pub fn affected(row_count: u64) -> Self {
        Self { rows: Vec::new(), row_count }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of `column` across all rows, skipping rows that lack it.
    pub fn column<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows.iter().filter_map(move |row| row.get(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn from_rows_counts_returned_rows() {
        let result = QueryResult::from_rows(vec![
            row(json!({ "id": 1 })),
            row(json!({ "id": 2 })),
        ]);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.first().unwrap()["id"], 1);
    }

    #[test]
    fn affected_has_count_but_no_rows() {
        let result = QueryResult::affected(7);
        assert!(result.is_empty());
        assert_eq!(result.row_count, 7);
    }

    #[test]
    fn column_skips_rows_without_the_field() {
        let result = QueryResult::from_rows(vec![
            row(json!({ "salary": 10 })),
            row(json!({ "name": "x" })),
            row(json!({ "salary": 30 })),
        ]);
        let salaries: Vec<_> = result.column("salary").cloned().collect();
        assert_eq!(salaries, vec![json!(10), json!(30)]);
    }
}
