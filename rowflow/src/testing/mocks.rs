//! Scripted implementations of [`SqlExecutor`], [`BulkLoader`], and
//! [`SchemaProvider`].

use crate::db::{BulkLoader, RowReader, SchemaProvider, SqlExecutor, TableData, TableDefinition};
use crate::errors::DbError;
use crate::row::RowValue;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A scripted [`SqlExecutor`].
///
/// Result sets are served in the order they were scripted, one per
/// `execute_reader` call; every executed statement is recorded for
/// assertions. Statements containing the configured failure substring
/// fail with a SQL error.
#[derive(Default)]
pub struct MockSqlExecutor {
    result_sets: Mutex<VecDeque<Vec<Vec<RowValue>>>>,
    scalars: Mutex<VecDeque<RowValue>>,
    executed: Mutex<Vec<String>>,
    fail_matching: Option<String>,
}

impl MockSqlExecutor {
    /// Creates an executor with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next result set.
    #[must_use]
    pub fn with_result_set(self, rows: Vec<Vec<RowValue>>) -> Self {
        self.result_sets.lock().push_back(rows);
        self
    }

    /// Scripts the next scalar result.
    #[must_use]
    pub fn with_scalar(self, value: RowValue) -> Self {
        self.scalars.lock().push_back(value);
        self
    }

    /// Fails any statement containing the given substring.
    #[must_use]
    pub fn failing_on(mut self, substring: impl Into<String>) -> Self {
        self.fail_matching = Some(substring.into());
        self
    }

    /// Returns every executed statement in order.
    #[must_use]
    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    fn record(&self, sql: &str) -> Result<(), DbError> {
        self.executed.lock().push(sql.to_string());
        match &self.fail_matching {
            Some(m) if sql.contains(m.as_str()) => Err(DbError::sql_with_statement(
                sql,
                format!("scripted failure on '{m}'"),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SqlExecutor for MockSqlExecutor {
    async fn execute_non_query(&self, sql: &str) -> Result<u64, DbError> {
        self.record(sql)?;
        Ok(0)
    }

    async fn execute_scalar(&self, sql: &str) -> Result<RowValue, DbError> {
        self.record(sql)?;
        Ok(self.scalars.lock().pop_front().unwrap_or(RowValue::Null))
    }

    async fn execute_reader(&self, sql: &str, reader: &mut RowReader<'_>) -> Result<(), DbError> {
        self.record(sql)?;
        let rows = self.result_sets.lock().pop_front().unwrap_or_default();
        for row in rows {
            reader.begin_row();
            for (position, value) in row.into_iter().enumerate() {
                reader.set_column(position, value);
            }
            reader.end_row();
        }
        Ok(())
    }
}

/// A [`BulkLoader`] that records every successfully loaded batch.
#[derive(Default)]
pub struct RecordingBulkLoader {
    batches: Mutex<Vec<TableData>>,
    calls: AtomicUsize,
    fail_on_batch: Option<usize>,
    prepared: AtomicBool,
    cleaned: AtomicBool,
}

impl RecordingBulkLoader {
    /// Creates a loader that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the batch with the given zero-based call index.
    #[must_use]
    pub fn failing_on_batch(mut self, index: usize) -> Self {
        self.fail_on_batch = Some(index);
        self
    }

    /// Returns the batches loaded so far.
    #[must_use]
    pub fn batches(&self) -> Vec<TableData> {
        self.batches.lock().clone()
    }

    /// Returns true once `prepare` was called.
    #[must_use]
    pub fn prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    /// Returns true once `cleanup` was called.
    #[must_use]
    pub fn cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BulkLoader for RecordingBulkLoader {
    async fn prepare(&self, _table: &str) -> Result<(), DbError> {
        self.prepared.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn bulk_insert(&self, data: &TableData) -> Result<(), DbError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_batch == Some(call) {
            return Err(DbError::bulk_load(
                &data.table,
                format!("scripted failure on batch {call}"),
            ));
        }
        self.batches.lock().push(data.clone());
        Ok(())
    }

    async fn cleanup(&self, _table: &str) -> Result<(), DbError> {
        self.cleaned.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A [`SchemaProvider`] serving one fixed definition.
pub struct StaticSchemaProvider {
    definition: TableDefinition,
}

impl StaticSchemaProvider {
    /// Creates a provider serving the given definition for any table
    /// name.
    #[must_use]
    pub fn new(definition: TableDefinition) -> Self {
        Self { definition }
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn table_definition(&self, _table: &str) -> Result<TableDefinition, DbError> {
        Ok(self.definition.clone())
    }
}
