//! Schemaless key/value rows.

use super::schema::RowAccess;
use super::RowValue;
use serde::{Deserialize, Serialize};

/// A dynamic row: an ordered list of named column values.
///
/// Column order is insertion order, which keeps bulk-load column maps
/// deterministic. Lookup is linear; dynamic rows are meant for the
/// dozens-of-columns scale of tabular records, not as a general map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicRow {
    values: Vec<(String, RowValue)>,
}

impl DynamicRow {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<RowValue>) -> Self {
        self.insert(column, value);
        self
    }

    /// Inserts or replaces a column value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<RowValue>) {
        let column = column.into();
        let value = value.into();
        match self.values.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = value,
            None => self.values.push((column, value)),
        }
    }

    /// Removes a column, returning its value if present.
    pub fn remove(&mut self, column: &str) -> Option<RowValue> {
        let index = self.values.iter().position(|(name, _)| name == column)?;
        Some(self.values.remove(index).1)
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over `(column, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RowValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl RowAccess for DynamicRow {
    fn columns(&self) -> Vec<String> {
        self.values.iter().map(|(name, _)| name.clone()).collect()
    }

    fn get(&self, column: &str) -> Option<RowValue> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.clone())
    }

    fn set(&mut self, column: &str, value: RowValue) -> bool {
        self.insert(column, value);
        true
    }
}

impl<K: Into<String>, V: Into<RowValue>> FromIterator<(K, V)> for DynamicRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Self::new();
        for (column, value) in iter {
            row.insert(column, value);
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_insert_preserves_order() {
        let row = DynamicRow::new().with("b", 1i64).with("a", 2i64);
        assert_eq!(row.columns(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut row = DynamicRow::new().with("a", 1i64).with("b", 2i64);
        row.insert("a", 9i64);
        assert_eq!(row.get("a"), Some(RowValue::Int(9)));
        assert_eq!(row.columns(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_set_always_succeeds() {
        let mut row = DynamicRow::new();
        assert!(row.set("fresh", RowValue::from("v")));
        assert_eq!(row.get("fresh"), Some(RowValue::Text("v".to_string())));
    }

    #[test]
    fn test_from_iterator() {
        let row: DynamicRow = vec![("id", 1i64), ("qty", 3i64)].into_iter().collect();
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("qty"), Some(RowValue::Int(3)));
    }
}
