//! Destination stages: the graph's exit points.

use super::{ErrorPort, ErrorRecord, Stage};
use crate::buffer::{Buffer, Capacity, Completion, CompletionCell};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::LinkTarget;
use crate::row::FlowRow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// A push contract for custom row consumers (file writers, APIs, ...).
#[async_trait]
pub trait RowConsumer: Send {
    /// The row type consumed.
    type Row: FlowRow;

    /// Writes one row.
    async fn write_row(&mut self, row: Self::Row) -> Result<(), FlowError>;

    /// Called once after the last row; flush and release resources here.
    async fn finish(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
}

/// A destination that collects rows into memory.
pub struct MemoryDestination<T> {
    name: String,
    input: Buffer<T>,
    rows: Arc<Mutex<Vec<T>>>,
    capacity: Capacity,
    done: CompletionCell,
    started: bool,
}

impl<T: FlowRow> MemoryDestination<T> {
    /// Creates an empty in-memory destination.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            input: Buffer::new(format!("{name}.in"), None),
            rows: Arc::new(Mutex::new(Vec::new())),
            name,
            capacity: Capacity::Default,
            done: CompletionCell::new(),
            started: false,
        }
    }

    /// Overrides the input buffer capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Returns a handle to the collected rows.
    ///
    /// Read it after the stage's completion resolves; until then the
    /// collection is still being appended to.
    #[must_use]
    pub fn rows(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.rows)
    }
}

impl<T: FlowRow> LinkTarget<T> for MemoryDestination<T> {
    fn input_buffer(&self) -> Buffer<T> {
        self.input.clone()
    }
}

impl<T: FlowRow> Stage for MemoryDestination<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        self.started = true;
        self.input
            .set_capacity(self.capacity.resolve(ctx.buffer_capacity()));

        let input = self.input.clone();
        let rows = Arc::clone(&self.rows);
        let done = self.done.clone();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => {
                        let err = StageError::cancelled(&name);
                        input.fault(err.clone());
                        done.fault(err);
                        return;
                    }
                    popped = input.pop() => popped,
                };
                match popped {
                    Ok(Some(row)) => rows.lock().push(row),
                    Ok(None) => {
                        debug!(stage = %name, rows = rows.lock().len(), "destination completed");
                        done.done();
                        return;
                    }
                    Err(err) => {
                        done.fault(err);
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.done.handle()
    }
}

/// A destination driven by a [`RowConsumer`].
///
/// A failing `write_row` is redirected to the linked error sink, or faults
/// the stage when none is linked. A failing `finish` always faults.
pub struct CustomDestination<C: RowConsumer> {
    name: String,
    input: Buffer<C::Row>,
    consumer: Option<C>,
    errors: ErrorPort,
    capacity: Capacity,
    done: CompletionCell,
    started: bool,
}

impl<C: RowConsumer + 'static> CustomDestination<C> {
    /// Creates a destination over the given consumer.
    #[must_use]
    pub fn new(name: impl Into<String>, consumer: C) -> Self {
        let name = name.into();
        Self {
            input: Buffer::new(format!("{name}.in"), None),
            consumer: Some(consumer),
            errors: ErrorPort::new(&name),
            name,
            capacity: Capacity::Default,
            done: CompletionCell::new(),
            started: false,
        }
    }

    /// Overrides the input buffer capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Links the error output to a sink; failing rows are redirected
    /// there instead of faulting the stage.
    pub fn link_error_to<D: LinkTarget<ErrorRecord> + ?Sized>(&mut self, sink: &D) {
        self.errors.link_to(sink);
    }
}

impl<C: RowConsumer + 'static> LinkTarget<C::Row> for CustomDestination<C> {
    fn input_buffer(&self) -> Buffer<C::Row> {
        self.input.clone()
    }
}

impl<C: RowConsumer + 'static> Stage for CustomDestination<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        let Some(mut consumer) = self.consumer.take() else {
            return Err(ConfigError::new(&self.name, "consumer already consumed").into());
        };
        self.started = true;

        self.input
            .set_capacity(self.capacity.resolve(ctx.buffer_capacity()));
        self.errors.start(ctx);
        self.errors.add_producer();

        let input = self.input.clone();
        let errors = self.errors.handle();
        let done = self.done.clone();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => {
                        let err = StageError::cancelled(&name);
                        input.fault(err.clone());
                        errors.fault(err.clone());
                        done.fault(err);
                        return;
                    }
                    popped = input.pop() => popped,
                };
                match popped {
                    Ok(Some(row)) => {
                        let snapshot = errors.is_linked().then(|| row.clone());
                        if let Err(err) = consumer.write_row(row).await {
                            if let Some(snapshot) = snapshot {
                                if errors.redirect(err.to_string(), &snapshot).await.is_ok() {
                                    continue;
                                }
                            }
                            let stage_err = StageError::new(&name, &err);
                            input.fault(stage_err.clone());
                            errors.fault(stage_err.clone());
                            done.fault(stage_err);
                            return;
                        }
                    }
                    Ok(None) => {
                        match consumer.finish().await {
                            Ok(()) => done.done(),
                            Err(err) => done.fault(StageError::new(&name, &err)),
                        }
                        errors.producer_done();
                        return;
                    }
                    Err(err) => {
                        errors.fault(err.clone());
                        done.fault(err);
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.done.handle()
    }
}
