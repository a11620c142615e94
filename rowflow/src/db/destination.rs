//! Bulk-loading rows into a database table.

use super::{BulkLoader, SchemaProvider, TableData};
use crate::buffer::{Buffer, Capacity, Completion, CompletionCell};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::LinkTarget;
use crate::row::{FlowRow, RowAccess, RowValue};
use crate::stages::{ErrorPort, ErrorRecord, Stage};
use std::sync::Arc;
use tracing::debug;

/// A destination bulk-loading rows into one table.
///
/// Rows are buffered into batches and handed to the [`BulkLoader`]. The
/// column set is resolved at startup: explicitly configured columns win,
/// then the schema provider's definition, then the columns of the first
/// row seen. A failing batch is redirected whole (as a JSON array) to the
/// linked error sink, or faults the stage.
pub struct DbDestination<T> {
    name: String,
    input: Buffer<T>,
    loader: Arc<dyn BulkLoader>,
    table: String,
    columns: Option<Vec<String>>,
    provider: Option<Arc<dyn SchemaProvider>>,
    errors: ErrorPort,
    batch_size: Option<usize>,
    capacity: Capacity,
    done: CompletionCell,
    started: bool,
}

impl<T: FlowRow + RowAccess> DbDestination<T> {
    /// Creates a destination loading into `table`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        loader: Arc<dyn BulkLoader>,
        table: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            input: Buffer::new(format!("{name}.in"), None),
            loader,
            table: table.into(),
            columns: None,
            provider: None,
            errors: ErrorPort::new(&name),
            name,
            batch_size: None,
            capacity: Capacity::Default,
            done: CompletionCell::new(),
            started: false,
        }
    }

    /// Fixes the loaded column set explicitly.
    #[must_use]
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Resolves the column set from the catalog at startup.
    #[must_use]
    pub fn with_schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Overrides the batch size (defaults to the context's batch size).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Overrides the input buffer capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Links the error output to a sink; failing batches are redirected
    /// there instead of faulting the stage.
    pub fn link_error_to<D: LinkTarget<ErrorRecord> + ?Sized>(&mut self, sink: &D) {
        self.errors.link_to(sink);
    }
}

/// Builds the positional batch payload for a set of rows.
fn build_batch<T: RowAccess>(table: &str, columns: &[String], rows: &[T]) -> TableData {
    let mut data = TableData::new(table, columns.to_vec());
    for row in rows {
        data.push_row(
            columns
                .iter()
                .map(|c| row.get(c).unwrap_or(RowValue::Null))
                .collect(),
        );
    }
    data
}

impl<T: FlowRow + RowAccess> LinkTarget<T> for DbDestination<T> {
    fn input_buffer(&self) -> Buffer<T> {
        self.input.clone()
    }
}

impl<T: FlowRow + RowAccess> Stage for DbDestination<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        let batch_size = self.batch_size.unwrap_or_else(|| ctx.batch_size());
        if batch_size == 0 {
            return Err(ConfigError::new(&self.name, "batch size must be at least 1").into());
        }
        self.started = true;

        self.input
            .set_capacity(self.capacity.resolve(ctx.buffer_capacity()));
        self.errors.start(ctx);
        self.errors.add_producer();

        let input = self.input.clone();
        let loader = Arc::clone(&self.loader);
        let table = self.table.clone();
        let mut columns = self.columns.clone();
        let provider = self.provider.clone();
        let errors = self.errors.handle();
        let done = self.done.clone();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let fault_all = |err: StageError| {
                input.fault(err.clone());
                errors.fault(err.clone());
                done.fault(err);
            };

            if columns.is_none() {
                if let Some(provider) = &provider {
                    match provider.table_definition(&table).await {
                        Ok(def) => columns = Some(def.column_names()),
                        Err(err) => {
                            fault_all(StageError::new(&name, &err));
                            return;
                        }
                    }
                }
            }

            if let Err(err) = loader.prepare(&table).await {
                fault_all(StageError::new(&name, &err));
                return;
            }

            let mut chunk: Vec<T> = Vec::with_capacity(batch_size);
            let mut loaded = 0u64;
            let outcome = loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => break Err(StageError::cancelled(&name)),
                    popped = input.pop() => popped,
                };
                match popped {
                    Ok(Some(row)) => {
                        // Last resort: mirror the first row's own columns.
                        if columns.is_none() {
                            columns = Some(row.columns());
                        }
                        chunk.push(row);
                        if chunk.len() == batch_size {
                            let cols = columns.as_deref().unwrap_or_default();
                            match flush(&name, &loader, &table, cols, &mut chunk, &errors).await {
                                Ok(n) => loaded += n,
                                Err(err) => break Err(err),
                            }
                        }
                    }
                    Ok(None) => {
                        if !chunk.is_empty() {
                            let cols = columns.as_deref().unwrap_or_default();
                            match flush(&name, &loader, &table, cols, &mut chunk, &errors).await {
                                Ok(n) => loaded += n,
                                Err(err) => break Err(err),
                            }
                        }
                        break Ok(());
                    }
                    Err(err) => break Err(err),
                }
            };

            // Cleanup runs on success and on failure alike.
            let cleanup = loader.cleanup(&table).await;

            match (outcome, cleanup) {
                (Ok(()), Ok(())) => {
                    debug!(stage = %name, rows = loaded, table = %table, "bulk load complete");
                    errors.producer_done();
                    done.done();
                }
                (Ok(()), Err(err)) => fault_all(StageError::new(&name, &err)),
                (Err(err), _) => fault_all(err),
            }
        });
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.done.handle()
    }
}

/// Loads one batch; a loader error is redirected or becomes the stage
/// fault.
async fn flush<T: FlowRow + RowAccess>(
    name: &str,
    loader: &Arc<dyn BulkLoader>,
    table: &str,
    columns: &[String],
    chunk: &mut Vec<T>,
    errors: &crate::stages::ErrorHandle,
) -> Result<u64, StageError> {
    let rows = std::mem::take(chunk);
    let data = build_batch(table, columns, &rows);
    match loader.bulk_insert(&data).await {
        Ok(()) => Ok(rows.len() as u64),
        Err(err) => {
            if errors.is_linked() && errors.redirect(err.to_string(), &rows).await.is_ok() {
                Ok(0)
            } else {
                Err(StageError::new(name, &err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::DynamicRow;
    use crate::testing::RecordingBulkLoader;

    fn row(id: i64) -> DynamicRow {
        DynamicRow::new().with("id", id).with("name", format!("r{id}"))
    }

    #[tokio::test]
    async fn test_batches_by_size() {
        let ctx = ExecutionContext::new();
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut dest: DbDestination<DynamicRow> =
            DbDestination::new("load", Arc::clone(&loader) as _, "items").with_batch_size(2);
        dest.start(&ctx).unwrap();

        let input = dest.input_buffer();
        for id in 1..=5i64 {
            input.push(row(id)).await.unwrap();
        }
        input.complete();
        dest.completion().wait().await.unwrap();

        let batches = loader.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[2].len(), 1);
        assert_eq!(batches[0].columns, vec!["id", "name"]);
        assert!(loader.prepared());
        assert!(loader.cleaned());
    }

    #[tokio::test]
    async fn test_missing_column_loads_as_null() {
        let ctx = ExecutionContext::new();
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut dest: DbDestination<DynamicRow> =
            DbDestination::new("load", Arc::clone(&loader) as _, "items")
                .with_columns(["id", "name", "extra"]);
        dest.start(&ctx).unwrap();

        let input = dest.input_buffer();
        input.push(row(1)).await.unwrap();
        input.complete();
        dest.completion().wait().await.unwrap();

        let batches = loader.batches();
        assert_eq!(batches[0].rows[0][2], RowValue::Null);
    }

    #[tokio::test]
    async fn test_failing_batch_redirects_and_continues() {
        let ctx = ExecutionContext::new();
        let loader = Arc::new(RecordingBulkLoader::new().failing_on_batch(0));
        let mut dest: DbDestination<DynamicRow> =
            DbDestination::new("load", Arc::clone(&loader) as _, "items").with_batch_size(1);
        let errs: Buffer<ErrorRecord> = Buffer::new("errs", None);
        dest.link_error_to(&errs);
        dest.start(&ctx).unwrap();

        let input = dest.input_buffer();
        input.push(row(1)).await.unwrap();
        input.push(row(2)).await.unwrap();
        input.complete();
        dest.completion().wait().await.unwrap();

        // First batch redirected, second loaded.
        assert_eq!(loader.batches().len(), 1);
        let record = errs.pop().await.unwrap().unwrap();
        assert!(record.row_json.contains("r1"));
    }

    #[tokio::test]
    async fn test_failing_batch_faults_without_sink() {
        let ctx = ExecutionContext::new();
        let loader = Arc::new(RecordingBulkLoader::new().failing_on_batch(0));
        let mut dest: DbDestination<DynamicRow> =
            DbDestination::new("load", Arc::clone(&loader) as _, "items").with_batch_size(1);
        dest.start(&ctx).unwrap();

        let input = dest.input_buffer();
        input.push(row(1)).await.unwrap();

        assert!(dest.completion().wait().await.is_err());
        assert!(loader.cleaned());
    }
}
