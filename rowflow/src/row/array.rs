//! Positional array rows.

use super::schema::RowAccess;
use super::RowValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A positional row: an ordered array of values with optional shared
/// column names.
///
/// When no names are attached, columns are addressed by their decimal
/// index ("0", "1", ...). The name list is shared across all rows of a
/// stream, so attaching it per row is cheap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayRow {
    names: Option<Arc<Vec<String>>>,
    values: Vec<RowValue>,
}

impl ArrayRow {
    /// Creates an unnamed positional row.
    #[must_use]
    pub fn new(values: Vec<RowValue>) -> Self {
        Self {
            names: None,
            values,
        }
    }

    /// Creates a row with a shared column-name list.
    ///
    /// Values beyond the name list are addressed by index only.
    #[must_use]
    pub fn with_names(names: Arc<Vec<String>>, values: Vec<RowValue>) -> Self {
        Self {
            names: Some(names),
            values,
        }
    }

    /// Returns the number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the row holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reads a value by position.
    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<&RowValue> {
        self.values.get(index)
    }

    /// Writes a value by position. Returns false when out of bounds.
    pub fn set_index(&mut self, index: usize, value: RowValue) -> bool {
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Returns the underlying values.
    #[must_use]
    pub fn values(&self) -> &[RowValue] {
        &self.values
    }

    /// Consumes the row, returning the values.
    #[must_use]
    pub fn into_values(self) -> Vec<RowValue> {
        self.values
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        if let Some(names) = &self.names {
            if let Some(index) = names.iter().position(|n| n == column) {
                return Some(index);
            }
        }
        column.parse::<usize>().ok().filter(|i| *i < self.values.len())
    }
}

impl RowAccess for ArrayRow {
    fn columns(&self) -> Vec<String> {
        match &self.names {
            Some(names) => names.as_ref().clone(),
            None => (0..self.values.len()).map(|i| i.to_string()).collect(),
        }
    }

    fn get(&self, column: &str) -> Option<RowValue> {
        self.index_of(column).and_then(|i| self.values.get(i).cloned())
    }

    fn set(&mut self, column: &str, value: RowValue) -> bool {
        self.index_of(column)
            .is_some_and(|i| self.set_index(i, value))
    }
}

impl From<Vec<RowValue>> for ArrayRow {
    fn from(values: Vec<RowValue>) -> Self {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unnamed_columns_are_indices() {
        let row = ArrayRow::new(vec![RowValue::Int(1), RowValue::from("x")]);
        assert_eq!(row.columns(), vec!["0".to_string(), "1".to_string()]);
        assert_eq!(row.get("1"), Some(RowValue::Text("x".to_string())));
        assert_eq!(row.get("2"), None);
    }

    #[test]
    fn test_named_access() {
        let names = Arc::new(vec!["id".to_string(), "qty".to_string()]);
        let mut row = ArrayRow::with_names(names, vec![RowValue::Int(1), RowValue::Int(5)]);

        assert_eq!(row.get("qty"), Some(RowValue::Int(5)));
        assert!(row.set("qty", RowValue::Int(6)));
        assert_eq!(row.get_index(1), Some(&RowValue::Int(6)));
    }

    #[test]
    fn test_named_row_survives_json_round_trip() {
        let names = Arc::new(vec!["id".to_string(), "qty".to_string()]);
        let row = ArrayRow::with_names(names, vec![RowValue::Int(1), RowValue::Int(5)]);

        let json = serde_json::to_string(&row).unwrap();
        let back: ArrayRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
        assert_eq!(back.get("qty"), Some(RowValue::Int(5)));
    }

    #[test]
    fn test_set_out_of_bounds() {
        let mut row = ArrayRow::new(vec![RowValue::Int(1)]);
        assert!(!row.set_index(3, RowValue::Int(9)));
        assert!(!row.set("3", RowValue::Int(9)));
    }
}
