//! Row-at-a-time transformation.

use super::{ErrorHandle, ErrorPort, InitFn, Stage, TransformFn};
use crate::buffer::{Buffer, Capacity, Completion};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::{LinkSource, LinkTarget, OutputPort};
use crate::row::FlowRow;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Applies a fallible function to every row.
///
/// The function may map (`Ok(Some)`), drop (`Ok(None)`), or fail (`Err`)
/// each row independently. A failed row is redirected to the linked error
/// sink, or faults the stage when none is linked. With
/// [`with_parallelism`](Self::with_parallelism) greater than one, rows are
/// processed concurrently and output order is not preserved.
pub struct RowTransform<I, O = I> {
    name: String,
    input: Buffer<I>,
    output: OutputPort<O>,
    errors: ErrorPort,
    func: TransformFn<I, O>,
    init: Option<InitFn>,
    parallelism: usize,
    capacity: Capacity,
    started: bool,
}

impl<I: FlowRow, O: FlowRow> RowTransform<I, O> {
    /// Creates a transform from an infallible mapping function.
    #[must_use]
    pub fn new(name: impl Into<String>, func: impl Fn(I) -> O + Send + Sync + 'static) -> Self {
        Self::try_new(name, move |row| Ok(Some(func(row))))
    }

    /// Creates a transform from a fallible mapping function.
    #[must_use]
    pub fn try_new(
        name: impl Into<String>,
        func: impl Fn(I) -> Result<Option<O>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            input: Buffer::new(format!("{name}.in"), None),
            output: OutputPort::new(format!("{name}.out")),
            errors: ErrorPort::new(&name),
            name,
            func: Arc::new(func),
            init: None,
            parallelism: 1,
            capacity: Capacity::Default,
            started: false,
        }
    }

    /// Registers a one-time async initializer, run lazily before the
    /// first row is processed. An initializer failure faults the stage.
    #[must_use]
    pub fn with_init(mut self, init: InitFn) -> Self {
        self.init = Some(init);
        self
    }

    /// Sets the number of concurrent workers. Values above one give up
    /// output ordering.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Overrides the buffer capacity for this stage's input and output.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Links the error output to a sink; per-row errors are redirected
    /// there instead of faulting the stage.
    pub fn link_error_to<D>(&mut self, sink: &D)
    where
        D: LinkTarget<super::ErrorRecord> + ?Sized,
    {
        self.errors.link_to(sink);
    }
}

impl<I: FlowRow> RowTransform<I, I> {
    /// Creates a pass/drop filter stage.
    #[must_use]
    pub fn filter(
        name: impl Into<String>,
        keep: impl Fn(&I) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::try_new(name, move |row| {
            if keep(&row) {
                Ok(Some(row))
            } else {
                Ok(None)
            }
        })
    }
}

impl<I: FlowRow, O: FlowRow> LinkTarget<I> for RowTransform<I, O> {
    fn input_buffer(&self) -> Buffer<I> {
        self.input.clone()
    }
}

impl<I: FlowRow, O: FlowRow> LinkSource<O> for RowTransform<I, O> {
    fn output_port(&self) -> &OutputPort<O> {
        &self.output
    }
}

impl<I: FlowRow, O: FlowRow> Stage for RowTransform<I, O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        if self.parallelism == 0 {
            return Err(ConfigError::new(&self.name, "parallelism must be at least 1").into());
        }
        self.started = true;

        let capacity = self.capacity.resolve(ctx.buffer_capacity());
        self.input.set_capacity(capacity);
        self.output.buffer().set_capacity(capacity);
        self.output.start_router(ctx, &self.name);
        self.errors.start(ctx);

        // Workers share the init cell so the initializer runs exactly once.
        let init_cell: Arc<OnceCell<Result<(), String>>> = Arc::new(OnceCell::new());

        for worker in 0..self.parallelism {
            self.output.buffer().add_producer();
            self.errors.add_producer();

            let input = self.input.clone();
            let output = self.output.buffer().clone();
            let errors = self.errors.handle();
            let func = Arc::clone(&self.func);
            let init = self.init.clone();
            let init_cell = Arc::clone(&init_cell);
            let cancel = ctx.cancellation().clone();
            let name = self.name.clone();

            tokio::spawn(async move {
                if let Some(init) = init {
                    let outcome = init_cell
                        .get_or_init(|| async move { init().await.map_err(|e| e.to_string()) })
                        .await;
                    if let Err(message) = outcome {
                        let err = StageError::new(&name, message);
                        input.fault(err.clone());
                        output.fault(err.clone());
                        errors.fault(err);
                        return;
                    }
                }

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
                            // Only pay for the snapshot when someone can
                            // receive it.
                            let snapshot = errors.is_linked().then(|| row.clone());
                            match func(row) {
                                Ok(Some(out)) => {
                                    if output.push(out).await.is_err() {
                                        input.fault(StageError::new(
                                            &name,
                                            "downstream terminated",
                                        ));
                                        errors.producer_done();
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    if let Some(snapshot) = snapshot {
                                        if errors.redirect(err.to_string(), &snapshot).await.is_err()
                                        {
                                            fault_all(&input, &output, &errors, &name, &err);
                                            return;
                                        }
                                    } else {
                                        fault_all(&input, &output, &errors, &name, &err);
                                        return;
                                    }
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(stage = %name, worker, "input exhausted");
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
        }
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.output.completion()
    }
}

fn fault_all<I: Send, O: Send>(
    input: &Buffer<I>,
    output: &Buffer<O>,
    errors: &ErrorHandle,
    name: &str,
    err: &FlowError,
) {
    let stage_err = StageError::new(name, err);
    input.fault(stage_err.clone());
    output.fault(stage_err.clone());
    errors.fault(stage_err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::ErrorRecord;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn drain<T: FlowRow>(buffer: &Buffer<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(row) = buffer.pop().await.unwrap() {
            out.push(row);
        }
        out
    }

    #[tokio::test]
    async fn test_maps_rows() {
        let ctx = ExecutionContext::new();
        let mut stage = RowTransform::new("double", |v: i64| v * 2);
        let sink: Buffer<i64> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        for v in [1i64, 2, 3] {
            input.push(v).await.unwrap();
        }
        input.complete();

        assert_eq!(drain(&sink).await, vec![2, 4, 6]);
        stage.completion().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_filter_drops_rows() {
        let ctx = ExecutionContext::new();
        let mut stage = RowTransform::filter("odd", |v: &i64| v % 2 == 1);
        let sink: Buffer<i64> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        for v in 1..=4i64 {
            input.push(v).await.unwrap();
        }
        input.complete();

        assert_eq!(drain(&sink).await, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_error_without_sink_faults_stage() {
        let ctx = ExecutionContext::new();
        let mut stage: RowTransform<i64> =
            RowTransform::try_new("strict", |v: i64| {
                if v < 0 {
                    Err(FlowError::processing("negative"))
                } else {
                    Ok(Some(v))
                }
            });
        let sink: Buffer<i64> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(-1).await.unwrap();

        let err = stage.completion().wait().await.unwrap_err();
        assert!(err.message.contains("negative"));
        assert!(sink.completion().wait().await.is_err());
        // The faulting stage's own input is torn down too, so upstream
        // pushes unblock instead of hanging.
        assert!(input.is_faulted());
    }

    #[tokio::test]
    async fn test_error_with_sink_keeps_stage_alive() {
        let ctx = ExecutionContext::new();
        let mut stage: RowTransform<i64> =
            RowTransform::try_new("lenient", |v: i64| {
                if v < 0 {
                    Err(FlowError::processing("negative"))
                } else {
                    Ok(Some(v))
                }
            });
        let sink: Buffer<i64> = Buffer::new("sink", None);
        let errs: Buffer<ErrorRecord> = Buffer::new("errs", None);
        stage.link_to(&sink);
        stage.link_error_to(&errs);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        for v in [1i64, -2, 3] {
            input.push(v).await.unwrap();
        }
        input.complete();

        assert_eq!(drain(&sink).await, vec![1, 3]);
        let records = drain(&errs).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, "lenient");
        assert!(records[0].message.contains("negative"));
        assert_eq!(records[0].row_json, "-2");
        stage.completion().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_parallel_workers_process_everything() {
        let ctx = ExecutionContext::new();
        let mut stage = RowTransform::new("par", |v: i64| v + 1).with_parallelism(4);
        let sink: Buffer<i64> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        for v in 0..50i64 {
            input.push(v).await.unwrap();
        }
        input.complete();

        let mut rows = drain(&sink).await;
        rows.sort_unstable();
        assert_eq!(rows, (1..=50i64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_init_runs_once_before_first_row() {
        let ctx = ExecutionContext::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut stage = RowTransform::new("warm", |v: i64| v)
            .with_parallelism(3)
            .with_init(Arc::new(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }));
        let sink: Buffer<i64> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(7).await.unwrap();
        input.complete();

        assert_eq!(drain(&sink).await, vec![7]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_init_failure_faults_stage() {
        let ctx = ExecutionContext::new();
        let mut stage = RowTransform::new("broken", |v: i64| v).with_init(Arc::new(|| {
            async { Err(FlowError::processing("connect refused")) }.boxed()
        }));
        let sink: Buffer<i64> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let err = stage.completion().wait().await.unwrap_err();
        assert!(err.message.contains("connect refused"));
    }

    #[tokio::test]
    async fn test_zero_parallelism_rejected() {
        let ctx = ExecutionContext::new();
        let mut stage = RowTransform::new("bad", |v: i64| v).with_parallelism(0);
        assert!(matches!(stage.start(&ctx), Err(FlowError::Config(_))));
    }
}
