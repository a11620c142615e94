//! Chunked transformation.

use super::{ErrorPort, ErrorRecord, Stage};
use crate::buffer::{Buffer, Capacity, Completion};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::{LinkSource, LinkTarget, OutputPort};
use crate::row::FlowRow;
use std::sync::Arc;
use tracing::debug;

/// Applies a function to fixed-size chunks of the input.
///
/// Rows are accumulated until the chunk size is reached, the function is
/// applied, and the resulting rows are emitted before the next chunk is
/// collected. A final partial chunk is flushed when the input completes.
/// A chunk error is one error context: the whole chunk is redirected (as
/// a JSON array) when an error sink is linked, otherwise the stage faults.
pub struct BatchTransform<I, O = I> {
    name: String,
    input: Buffer<I>,
    output: OutputPort<O>,
    errors: ErrorPort,
    #[allow(clippy::type_complexity)]
    func: Arc<dyn Fn(Vec<I>) -> Result<Vec<O>, FlowError> + Send + Sync>,
    batch_size: Option<usize>,
    capacity: Capacity,
    started: bool,
}

impl<I: FlowRow, O: FlowRow> BatchTransform<I, O> {
    /// Creates a batch transform from a chunk function. The chunk size
    /// defaults to the execution context's batch size.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(Vec<I>) -> Result<Vec<O>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            input: Buffer::new(format!("{name}.in"), None),
            output: OutputPort::new(format!("{name}.out")),
            errors: ErrorPort::new(&name),
            name,
            func: Arc::new(func),
            batch_size: None,
            capacity: Capacity::Default,
            started: false,
        }
    }

    /// Overrides the chunk size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Overrides the buffer capacity for this stage's input and output.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Links the error output to a sink; failing chunks are redirected
    /// there instead of faulting the stage.
    pub fn link_error_to<D: LinkTarget<ErrorRecord> + ?Sized>(&mut self, sink: &D) {
        self.errors.link_to(sink);
    }
}

impl<I: FlowRow, O: FlowRow> LinkTarget<I> for BatchTransform<I, O> {
    fn input_buffer(&self) -> Buffer<I> {
        self.input.clone()
    }
}

impl<I: FlowRow, O: FlowRow> LinkSource<O> for BatchTransform<I, O> {
    fn output_port(&self) -> &OutputPort<O> {
        &self.output
    }
}

impl<I: FlowRow, O: FlowRow> Stage for BatchTransform<I, O> {
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

        let capacity = self.capacity.resolve(ctx.buffer_capacity());
        self.input.set_capacity(capacity);
        self.output.buffer().set_capacity(capacity);
        self.output.start_router(ctx, &self.name);
        self.output.buffer().add_producer();
        self.errors.start(ctx);
        self.errors.add_producer();

        let input = self.input.clone();
        let output = self.output.buffer().clone();
        let errors = self.errors.handle();
        let func = Arc::clone(&self.func);
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut chunk: Vec<I> = Vec::with_capacity(batch_size);
            loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => {
                        let err = StageError::cancelled(&name);
                        input.fault(err.clone());
                        output.fault(err.clone());
                        errors.fault(err);
                        return;
                    }
                    popped = input.pop() => popped,
                };
                match popped {
                    Ok(Some(row)) => {
                        chunk.push(row);
                        if chunk.len() == batch_size {
                            let full = std::mem::replace(&mut chunk, Vec::with_capacity(batch_size));
                            if !apply(&name, &func, full, &input, &output, &errors).await {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        if !chunk.is_empty() {
                            debug!(stage = %name, rows = chunk.len(), "flushing final partial chunk");
                            let last = std::mem::take(&mut chunk);
                            if !apply(&name, &func, last, &input, &output, &errors).await {
                                return;
                            }
                        }
                        output.producer_done();
                        errors.producer_done();
                        return;
                    }
                    Err(err) => {
                        output.fault(err.clone());
                        errors.fault(err);
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.output.completion()
    }
}

/// Applies one chunk; returns false when the worker must stop.
async fn apply<I: FlowRow, O: FlowRow>(
    name: &str,
    func: &Arc<dyn Fn(Vec<I>) -> Result<Vec<O>, FlowError> + Send + Sync>,
    chunk: Vec<I>,
    input: &Buffer<I>,
    output: &Buffer<O>,
    errors: &super::ErrorHandle,
) -> bool {
    let snapshot = errors.is_linked().then(|| chunk.clone());
    match func(chunk) {
        Ok(rows) => {
            for row in rows {
                if output.push(row).await.is_err() {
                    input.fault(StageError::new(name, "downstream terminated"));
                    errors.producer_done();
                    return false;
                }
            }
            true
        }
        Err(err) => {
            if let Some(snapshot) = snapshot {
                if errors.redirect(err.to_string(), &snapshot).await.is_ok() {
                    return true;
                }
            }
            let stage_err = StageError::new(name, &err);
            input.fault(stage_err.clone());
            output.fault(stage_err.clone());
            errors.fault(stage_err);
            false
        }
    }
}
