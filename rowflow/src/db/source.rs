//! Reading rows out of a database.

use super::{select_list, RowReader, SchemaProvider, SqlExecutor};
use crate::buffer::{Capacity, Completion};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::{LinkSource, LinkTarget, OutputPort};
use crate::row::{DynamicRow, FlowRow, RowValue};
use crate::stages::{ErrorPort, ErrorRecord, Stage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

enum Query {
    Sql { sql: String, columns: Vec<String> },
    Table {
        table: String,
        provider: Arc<dyn SchemaProvider>,
    },
}

type FactoryFn<T> = Arc<dyn Fn(&[String], Vec<RowValue>) -> Result<T, FlowError> + Send + Sync>;

/// A source reading rows from a database through a [`SqlExecutor`].
///
/// Each result row is materialized into `T` by a factory taking the
/// column names and the row's positional values. A factory error is
/// redirected to the linked error sink or faults the stage.
///
/// Driver delivery runs ahead of the graph through an internal channel,
/// so backpressure slows the materialization loop but not the driver's
/// result-set walk.
pub struct DbSource<T> {
    name: String,
    executor: Arc<dyn SqlExecutor>,
    query: Query,
    factory: FactoryFn<T>,
    output: OutputPort<T>,
    errors: ErrorPort,
    capacity: Capacity,
    started: bool,
}

impl<T: FlowRow> DbSource<T> {
    /// Creates a source over an explicit query. `columns` names the
    /// selected columns in order.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn SqlExecutor>,
        sql: impl Into<String>,
        columns: Vec<String>,
        factory: impl Fn(&[String], Vec<RowValue>) -> Result<T, FlowError> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            output: OutputPort::new(format!("{name}.out")),
            errors: ErrorPort::new(&name),
            name,
            executor,
            query: Query::Sql {
                sql: sql.into(),
                columns,
            },
            factory: Arc::new(factory),
            capacity: Capacity::Default,
            started: false,
        }
    }

    /// Creates a source reading a whole table; columns come from the
    /// schema provider at startup.
    #[must_use]
    pub fn from_table(
        name: impl Into<String>,
        executor: Arc<dyn SqlExecutor>,
        provider: Arc<dyn SchemaProvider>,
        table: impl Into<String>,
        factory: impl Fn(&[String], Vec<RowValue>) -> Result<T, FlowError> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            output: OutputPort::new(format!("{name}.out")),
            errors: ErrorPort::new(&name),
            name,
            executor,
            query: Query::Table {
                table: table.into(),
                provider,
            },
            factory: Arc::new(factory),
            capacity: Capacity::Default,
            started: false,
        }
    }

    /// Overrides the output buffer capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Links the error output to a sink.
    pub fn link_error_to<D: LinkTarget<ErrorRecord> + ?Sized>(&mut self, sink: &D) {
        self.errors.link_to(sink);
    }
}

impl DbSource<DynamicRow> {
    /// Creates a source emitting [`DynamicRow`]s from an explicit query.
    #[must_use]
    pub fn dynamic(
        name: impl Into<String>,
        executor: Arc<dyn SqlExecutor>,
        sql: impl Into<String>,
        columns: Vec<String>,
    ) -> Self {
        Self::new(name, executor, sql, columns, dynamic_factory)
    }

    /// Creates a source emitting [`DynamicRow`]s from a whole table.
    #[must_use]
    pub fn dynamic_table(
        name: impl Into<String>,
        executor: Arc<dyn SqlExecutor>,
        provider: Arc<dyn SchemaProvider>,
        table: impl Into<String>,
    ) -> Self {
        Self::from_table(name, executor, provider, table, dynamic_factory)
    }
}

fn dynamic_factory(columns: &[String], values: Vec<RowValue>) -> Result<DynamicRow, FlowError> {
    Ok(columns.iter().cloned().zip(values).collect())
}

impl<T: FlowRow> LinkSource<T> for DbSource<T> {
    fn output_port(&self) -> &OutputPort<T> {
        &self.output
    }
}

impl<T: FlowRow> Stage for DbSource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        if let Query::Sql { columns, .. } = &self.query {
            if columns.is_empty() {
                return Err(ConfigError::new(&self.name, "query column list is empty").into());
            }
        }
        self.started = true;

        self.output
            .buffer()
            .set_capacity(self.capacity.resolve(ctx.buffer_capacity()));
        self.output.start_router(ctx, &self.name);
        self.output.buffer().add_producer();
        self.errors.start(ctx);
        self.errors.add_producer();

        let executor = Arc::clone(&self.executor);
        let query = std::mem::replace(
            &mut self.query,
            Query::Sql {
                sql: String::new(),
                columns: Vec::new(),
            },
        );
        let factory = Arc::clone(&self.factory);
        let output = self.output.buffer().clone();
        let errors = self.errors.handle();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let fault_all = |err: StageError| {
                output.fault(err.clone());
                errors.fault(err);
            };

            let (sql, columns) = match query {
                Query::Sql { sql, columns } => (sql, columns),
                Query::Table { table, provider } => {
                    match provider.table_definition(&table).await {
                        Ok(def) => {
                            let columns = def.column_names();
                            let sql =
                                format!("SELECT {} FROM {}", select_list(&columns), def.name);
                            (sql, columns)
                        }
                        Err(err) => {
                            fault_all(StageError::new(&name, &err));
                            return;
                        }
                    }
                }
            };

            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<RowValue>>();
            let column_count = columns.len();
            let reader_task = tokio::spawn(async move {
                let mut reader = RowReader::new();
                // The hooks run sequentially from execute_reader but each
                // owns a handle, hence the shared cell.
                let state = Arc::new(parking_lot::Mutex::new(Vec::with_capacity(column_count)));
                {
                    let state = Arc::clone(&state);
                    reader.set_before_row(move || state.lock().clear());
                }
                for _ in 0..column_count {
                    let state = Arc::clone(&state);
                    reader.push_column_action(move |value| state.lock().push(value));
                }
                {
                    let state = Arc::clone(&state);
                    let tx = tx.clone();
                    reader.set_after_row(move || {
                        let row = std::mem::take(&mut *state.lock());
                        let _ = tx.send(row);
                    });
                }
                executor.execute_reader(&sql, &mut reader).await
            });

            loop {
                let received = tokio::select! {
                    () = cancel.cancelled() => {
                        fault_all(StageError::cancelled(&name));
                        return;
                    }
                    received = rx.recv() => received,
                };
                match received {
                    Some(values) => {
                        let snapshot = errors.is_linked().then(|| values.clone());
                        match factory(&columns, values) {
                            Ok(row) => {
                                if output.push(row).await.is_err() {
                                    errors.producer_done();
                                    return;
                                }
                            }
                            Err(err) => {
                                if let Some(snapshot) = snapshot {
                                    if errors
                                        .redirect(err.to_string(), &snapshot)
                                        .await
                                        .is_ok()
                                    {
                                        continue;
                                    }
                                }
                                fault_all(StageError::new(&name, &err));
                                return;
                            }
                        }
                    }
                    None => break,
                }
            }

            match reader_task.await {
                Ok(Ok(())) => {
                    debug!(stage = %name, "result set exhausted");
                    output.producer_done();
                    errors.producer_done();
                }
                Ok(Err(err)) => fault_all(StageError::new(&name, &err)),
                Err(err) => fault_all(StageError::new(&name, format!("reader task failed: {err}"))),
            }
        });
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.output.completion()
    }
}
