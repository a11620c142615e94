//! Whole-input transformation.

use super::Stage;
use crate::buffer::{Buffer, Capacity, Completion};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::{LinkSource, LinkTarget, OutputPort};
use crate::row::FlowRow;
use std::sync::Arc;
use tracing::debug;

/// Collects the entire input, applies one function to the whole set, and
/// streams the result out.
///
/// Nothing is emitted until the input completes, and the full input set is
/// held in memory; sorting and aggregation are the intended uses. A
/// function error faults the stage (there is no per-row error sink at this
/// granularity).
pub struct BlockTransform<I, O = I> {
    name: String,
    input: Buffer<I>,
    output: OutputPort<O>,
    #[allow(clippy::type_complexity)]
    func: Arc<dyn Fn(Vec<I>) -> Result<Vec<O>, FlowError> + Send + Sync>,
    capacity: Capacity,
    started: bool,
}

impl<I: FlowRow, O: FlowRow> BlockTransform<I, O> {
    /// Creates a block transform from a whole-set function.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(Vec<I>) -> Result<Vec<O>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            input: Buffer::new(format!("{name}.in"), None),
            output: OutputPort::new(format!("{name}.out")),
            name,
            func: Arc::new(func),
            capacity: Capacity::Default,
            started: false,
        }
    }

    /// Overrides the buffer capacity for this stage's input and output.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }
}

impl<I: FlowRow> BlockTransform<I, I> {
    /// Creates a sorting stage.
    #[must_use]
    pub fn sort_by(
        name: impl Into<String>,
        compare: impl Fn(&I, &I) -> std::cmp::Ordering + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, move |mut rows: Vec<I>| {
            rows.sort_by(&compare);
            Ok(rows)
        })
    }
}

impl<I: FlowRow, O: FlowRow> LinkTarget<I> for BlockTransform<I, O> {
    fn input_buffer(&self) -> Buffer<I> {
        self.input.clone()
    }
}

impl<I: FlowRow, O: FlowRow> LinkSource<O> for BlockTransform<I, O> {
    fn output_port(&self) -> &OutputPort<O> {
        &self.output
    }
}

impl<I: FlowRow, O: FlowRow> Stage for BlockTransform<I, O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        self.started = true;

        let capacity = self.capacity.resolve(ctx.buffer_capacity());
        self.input.set_capacity(capacity);
        self.output.buffer().set_capacity(capacity);
        self.output.start_router(ctx, &self.name);
        self.output.buffer().add_producer();

        let input = self.input.clone();
        let output = self.output.buffer().clone();
        let func = Arc::clone(&self.func);
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut collected = Vec::new();
            loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => {
                        let err = StageError::cancelled(&name);
                        input.fault(err.clone());
                        output.fault(err);
                        return;
                    }
                    popped = input.pop() => popped,
                };
                match popped {
                    Ok(Some(row)) => collected.push(row),
                    Ok(None) => break,
                    Err(err) => {
                        output.fault(err);
                        return;
                    }
                }
            }

            debug!(stage = %name, rows = collected.len(), "input complete, applying block function");
            match func(collected) {
                Ok(rows) => {
                    for row in rows {
                        if output.push(row).await.is_err() {
                            return;
                        }
                    }
                    output.producer_done();
                }
                Err(err) => {
                    let stage_err = StageError::new(&name, &err);
                    input.fault(stage_err.clone());
                    output.fault(stage_err);
                }
            }
        });
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.output.completion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emits_only_after_input_completes() {
        let ctx = ExecutionContext::new();
        let mut stage: BlockTransform<i64> = BlockTransform::new("sum", |rows: Vec<i64>| {
            Ok(vec![rows.iter().sum::<i64>()])
        });
        let sink: Buffer<i64> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(1).await.unwrap();
        input.push(2).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(sink.is_empty());

        input.push(3).await.unwrap();
        input.complete();

        assert_eq!(sink.pop().await.unwrap(), Some(6));
        assert_eq!(sink.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sort_by() {
        let ctx = ExecutionContext::new();
        let mut stage = BlockTransform::<i64>::sort_by("sort", |a, b| a.cmp(b));
        let sink: Buffer<i64> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        for v in [3i64, 1, 2] {
            input.push(v).await.unwrap();
        }
        input.complete();

        assert_eq!(sink.pop().await.unwrap(), Some(1));
        assert_eq!(sink.pop().await.unwrap(), Some(2));
        assert_eq!(sink.pop().await.unwrap(), Some(3));
        assert_eq!(sink.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_function_error_faults() {
        let ctx = ExecutionContext::new();
        let mut stage: BlockTransform<i64> =
            BlockTransform::new("bad", |_| Err(FlowError::processing("no good")));
        let sink: Buffer<i64> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(1).await.unwrap();
        input.complete();

        let err = stage.completion().wait().await.unwrap_err();
        assert!(err.message.contains("no good"));
        assert!(sink.completion().wait().await.is_err());
    }
}
