//! Row enrichment against a side table.

use super::{ErrorPort, ErrorRecord, InputHandle, Stage};
use crate::buffer::{Buffer, Capacity, Completion};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::{LinkSource, LinkTarget, OutputPort};
use crate::row::{FlowRow, RowAccess, RowValue};
use std::sync::Arc;
use tracing::debug;

/// A column pairing between the main input and the lookup side table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    /// Column on the main input row.
    pub input_column: String,
    /// Column on the lookup source row.
    pub lookup_column: String,
}

impl ColumnMap {
    /// Creates a pairing.
    #[must_use]
    pub fn new(input_column: impl Into<String>, lookup_column: impl Into<String>) -> Self {
        Self {
            input_column: input_column.into(),
            lookup_column: lookup_column.into(),
        }
    }
}

type LookupFn<I, S> = Arc<dyn Fn(I, &[S]) -> Result<Option<I>, FlowError> + Send + Sync>;

/// Enriches each input row against a fully materialized side table.
///
/// The secondary input (the lookup source) is drained completely before
/// the first main row is processed; main rows wait behind backpressure in
/// the meantime. Enrichment runs either through a custom transformation
/// ([`with_transform`](Self::with_transform)) or declaratively through
/// match/retrieve column pairings ([`with_columns`](Self::with_columns)).
pub struct Lookup<I, S> {
    name: String,
    input: Buffer<I>,
    source: Buffer<S>,
    output: OutputPort<I>,
    errors: ErrorPort,
    func: Option<LookupFn<I, S>>,
    capacity: Capacity,
    started: bool,
}

impl<I: FlowRow, S: FlowRow> Lookup<I, S> {
    /// Creates an unconfigured lookup; configure it with
    /// [`with_transform`](Self::with_transform) or
    /// [`with_columns`](Self::with_columns) before starting.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            input: Buffer::new(format!("{name}.in"), None),
            source: Buffer::new(format!("{name}.source"), None),
            output: OutputPort::new(format!("{name}.out")),
            errors: ErrorPort::new(&name),
            name,
            func: None,
            capacity: Capacity::Default,
            started: false,
        }
    }

    /// Configures a custom enrichment function over the side table.
    ///
    /// `Ok(None)` drops the row; `Err` is redirected to the error sink if
    /// one is linked.
    #[must_use]
    pub fn with_transform(
        mut self,
        func: impl Fn(I, &[S]) -> Result<Option<I>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        self.func = Some(Arc::new(func));
        self
    }

    /// Overrides the buffer capacity for this stage's buffers.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Links the error output to a sink.
    pub fn link_error_to<D: LinkTarget<ErrorRecord> + ?Sized>(&mut self, sink: &D) {
        self.errors.link_to(sink);
    }

    /// Returns the secondary input fed by the lookup source stage.
    #[must_use]
    pub fn source_port(&self) -> InputHandle<S> {
        InputHandle::new(self.source.clone())
    }
}

impl<I, S> Lookup<I, S>
where
    I: FlowRow + RowAccess,
    S: FlowRow + RowAccess,
{
    /// Configures declarative enrichment: the first side-table row whose
    /// `match_columns` all equal the input row's is used, and its
    /// `retrieve_columns` are copied onto the input row. A row matching
    /// nothing passes through unmodified.
    #[must_use]
    pub fn with_columns(
        mut self,
        match_columns: Vec<ColumnMap>,
        retrieve_columns: Vec<ColumnMap>,
    ) -> Self {
        self.func = Some(Arc::new(move |mut row: I, table: &[S]| {
            let hit = table.iter().find(|candidate| {
                match_columns.iter().all(|map| {
                    row.get(&map.input_column) == candidate.get(&map.lookup_column)
                })
            });
            if let Some(hit) = hit {
                for map in &retrieve_columns {
                    let value = hit.get(&map.lookup_column).unwrap_or(RowValue::Null);
                    row.set(&map.input_column, value);
                }
            }
            Ok(Some(row))
        }));
        self
    }
}

impl<I: FlowRow, S: FlowRow> LinkTarget<I> for Lookup<I, S> {
    fn input_buffer(&self) -> Buffer<I> {
        self.input.clone()
    }
}

impl<I: FlowRow, S: FlowRow> LinkSource<I> for Lookup<I, S> {
    fn output_port(&self) -> &OutputPort<I> {
        &self.output
    }
}

impl<I: FlowRow, S: FlowRow> Stage for Lookup<I, S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        let Some(func) = self.func.clone() else {
            return Err(ConfigError::new(
                &self.name,
                "no transformation and no match columns configured",
            )
            .into());
        };
        if self.source.producer_count() == 0 {
            return Err(ConfigError::new(&self.name, "lookup source is not linked").into());
        }
        self.started = true;

        let capacity = self.capacity.resolve(ctx.buffer_capacity());
        self.input.set_capacity(capacity);
        self.source.set_capacity(capacity);
        self.output.buffer().set_capacity(capacity);
        self.output.start_router(ctx, &self.name);
        self.output.buffer().add_producer();
        self.errors.start(ctx);
        self.errors.add_producer();

        let input = self.input.clone();
        let source = self.source.clone();
        let output = self.output.buffer().clone();
        let errors = self.errors.handle();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let fault_all = |err: StageError| {
                input.fault(err.clone());
                source.fault(err.clone());
                output.fault(err.clone());
                errors.fault(err);
            };

            // Materialize the side table first; main rows wait behind
            // backpressure until it is complete.
            let mut table: Vec<S> = Vec::new();
            loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => {
                        fault_all(StageError::cancelled(&name));
                        return;
                    }
                    popped = source.pop() => popped,
                };
                match popped {
                    Ok(Some(row)) => table.push(row),
                    Ok(None) => break,
                    Err(err) => {
                        fault_all(err);
                        return;
                    }
                }
            }
            debug!(stage = %name, rows = table.len(), "lookup table materialized");

            loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => {
                        fault_all(StageError::cancelled(&name));
                        return;
                    }
                    popped = input.pop() => popped,
                };
                match popped {
                    Ok(Some(row)) => {
                        let snapshot = errors.is_linked().then(|| row.clone());
                        match func(row, &table) {
                            Ok(Some(out)) => {
                                if output.push(out).await.is_err() {
                                    input.fault(StageError::new(&name, "downstream terminated"));
                                    errors.producer_done();
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                if let Some(snapshot) = snapshot {
                                    if errors.redirect(err.to_string(), &snapshot).await.is_ok() {
                                        continue;
                                    }
                                }
                                fault_all(StageError::new(&name, &err));
                                return;
                            }
                        }
                    }
                    Ok(None) => {
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
