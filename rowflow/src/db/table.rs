//! Table metadata and bulk-load payloads.

use crate::row::RowValue;
use std::collections::HashMap;

/// One column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    /// The column name.
    pub name: String,
    /// Whether the column is part of the table's identity key.
    pub is_identity: bool,
}

impl TableColumn {
    /// Creates a non-identity column.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_identity: false,
        }
    }

    /// Creates an identity column.
    #[must_use]
    pub fn identity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_identity: true,
        }
    }
}

/// A table definition: name plus columns in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    /// The table name.
    pub name: String,
    /// The columns in declaration order.
    pub columns: Vec<TableColumn>,
}

impl TableDefinition {
    /// Creates a definition.
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<TableColumn>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Returns the names of the identity columns.
    #[must_use]
    pub fn identity_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_identity)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Returns all column names in declaration order.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// A batch of rows ready for bulk load: a target table, a fixed column
/// order, and positional rows.
#[derive(Debug, Clone)]
pub struct TableData {
    /// The destination table name.
    pub table: String,
    /// The columns, in the positional order of each row.
    pub columns: Vec<String>,
    /// The rows; each has one value per column.
    pub rows: Vec<Vec<RowValue>>,
    positions: HashMap<String, usize>,
}

impl TableData {
    /// Creates an empty batch for the given table and column order.
    #[must_use]
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        let positions = columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
            positions,
        }
    }

    /// Appends one positional row. Callers must supply one value per
    /// column in column order.
    pub fn push_row(&mut self, row: Vec<RowValue>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Returns the position of a column, if present.
    #[must_use]
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// Returns the number of rows in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the batch holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_columns() {
        let table = TableDefinition::new(
            "orders",
            vec![
                TableColumn::identity("id"),
                TableColumn::new("total"),
                TableColumn::identity("region"),
            ],
        );
        assert_eq!(table.identity_columns(), vec!["id", "region"]);
        assert_eq!(table.column_names(), vec!["id", "total", "region"]);
    }

    #[test]
    fn test_table_data_positions() {
        let mut data = TableData::new("orders", vec!["id".to_string(), "total".to_string()]);
        data.push_row(vec![RowValue::Int(1), RowValue::Float(9.5)]);

        assert_eq!(data.column_position("total"), Some(1));
        assert_eq!(data.column_position("missing"), None);
        assert_eq!(data.len(), 1);
    }
}
