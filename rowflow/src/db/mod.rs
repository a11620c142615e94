//! Database connectivity: driver contracts and the stages built on them.
//!
//! The engine never speaks a wire protocol itself. Three small traits are
//! the seam to the outside world: [`SqlExecutor`] runs statements and
//! streams result sets, [`BulkLoader`] ingests batches, and
//! [`SchemaProvider`] resolves table definitions. Any driver implementing
//! them plugs into [`DbSource`], [`DbDestination`], and [`DbMerge`].

mod destination;
mod merge;
mod source;
mod table;

pub use destination::DbDestination;
pub use merge::{ChangeAction, DbMerge, DeletionStrategy, MergeDelta, MergeMode};
pub use source::DbSource;
pub use table::{TableColumn, TableData, TableDefinition};

use crate::errors::DbError;
use crate::row::RowValue;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Per-column delivery callbacks for a streamed result set.
///
/// The consumer registers one action per selected column plus optional
/// row boundary hooks; the driver walks the result set calling
/// [`begin_row`](Self::begin_row), [`set_column`](Self::set_column) for
/// each column position, and [`end_row`](Self::end_row).
pub struct RowReader<'a> {
    column_actions: Vec<Box<dyn FnMut(RowValue) + Send + 'a>>,
    before_row: Option<Box<dyn FnMut() + Send + 'a>>,
    after_row: Option<Box<dyn FnMut() + Send + 'a>>,
}

impl<'a> RowReader<'a> {
    /// Creates a reader with no registered actions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            column_actions: Vec::new(),
            before_row: None,
            after_row: None,
        }
    }

    /// Registers the delivery action for the next column position.
    pub fn push_column_action(&mut self, action: impl FnMut(RowValue) + Send + 'a) {
        self.column_actions.push(Box::new(action));
    }

    /// Registers a hook called before each row's columns.
    pub fn set_before_row(&mut self, hook: impl FnMut() + Send + 'a) {
        self.before_row = Some(Box::new(hook));
    }

    /// Registers a hook called after each row's columns.
    pub fn set_after_row(&mut self, hook: impl FnMut() + Send + 'a) {
        self.after_row = Some(Box::new(hook));
    }

    /// Returns the number of registered column actions.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.column_actions.len()
    }

    /// Driver side: signals the start of a row.
    pub fn begin_row(&mut self) {
        if let Some(hook) = &mut self.before_row {
            hook();
        }
    }

    /// Driver side: delivers the value at a column position. Positions
    /// without a registered action are ignored.
    pub fn set_column(&mut self, position: usize, value: RowValue) {
        if let Some(action) = self.column_actions.get_mut(position) {
            action(value);
        }
    }

    /// Driver side: signals the end of a row.
    pub fn end_row(&mut self) {
        if let Some(hook) = &mut self.after_row {
            hook();
        }
    }
}

impl Default for RowReader<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RowReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowReader")
            .field("columns", &self.column_actions.len())
            .finish()
    }
}

/// Executes SQL against a concrete database.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Runs a statement, returning the affected row count.
    async fn execute_non_query(&self, sql: &str) -> Result<u64, DbError>;

    /// Runs a query returning a single scalar.
    async fn execute_scalar(&self, sql: &str) -> Result<RowValue, DbError>;

    /// Runs a query, delivering each row through the reader.
    async fn execute_reader(&self, sql: &str, reader: &mut RowReader<'_>) -> Result<(), DbError>;
}

/// Ingests row batches, typically through a driver's fast path.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Called once before the first batch.
    async fn prepare(&self, _table: &str) -> Result<(), DbError> {
        Ok(())
    }

    /// Loads one batch.
    async fn bulk_insert(&self, data: &TableData) -> Result<(), DbError>;

    /// Called once after the last batch, on success or failure.
    async fn cleanup(&self, _table: &str) -> Result<(), DbError> {
        Ok(())
    }
}

/// Resolves table definitions from the database's catalog.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Returns the definition of a table.
    async fn table_definition(&self, table: &str) -> Result<TableDefinition, DbError>;
}

/// Runs a query and collects the full result set into memory.
///
/// Intended for side tables and merge snapshots, not streaming.
pub async fn fetch_all(
    executor: &dyn SqlExecutor,
    sql: &str,
    column_count: usize,
) -> Result<Vec<Vec<RowValue>>, DbError> {
    let rows: Arc<Mutex<Vec<Vec<RowValue>>>> = Arc::new(Mutex::new(Vec::new()));
    let current: Arc<Mutex<Vec<RowValue>>> = Arc::new(Mutex::new(Vec::new()));

    let mut reader = RowReader::new();
    {
        let current = Arc::clone(&current);
        reader.set_before_row(move || current.lock().clear());
    }
    for _ in 0..column_count {
        let current = Arc::clone(&current);
        reader.push_column_action(move |value| current.lock().push(value));
    }
    {
        let rows = Arc::clone(&rows);
        let current = Arc::clone(&current);
        reader.set_after_row(move || rows.lock().push(std::mem::take(&mut current.lock())));
    }

    executor.execute_reader(sql, &mut reader).await?;
    drop(reader);
    Ok(Arc::try_unwrap(rows).map_or_else(|arc| arc.lock().clone(), Mutex::into_inner))
}

/// Renders a column list for a SELECT statement.
pub(crate) fn select_list(columns: &[String]) -> String {
    columns.join(", ")
}
