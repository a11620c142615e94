//! Source stages: the graph's entry points.

use super::Stage;
use crate::buffer::{Capacity, Completion};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::{LinkSource, OutputPort};
use crate::row::FlowRow;
use async_trait::async_trait;
use tracing::debug;

/// A pull contract for custom row producers (file codecs, APIs, ...).
///
/// Any "produce the next record or signal end" shape plugs into the graph
/// through [`CustomSource`]; CSV, JSON, XML, and database readers are
/// interchangeable behind it.
#[async_trait]
pub trait RowProducer: Send {
    /// The row type produced.
    type Row: FlowRow;

    /// Produces the next row, or `Ok(None)` at end of input.
    async fn next_row(&mut self) -> Result<Option<Self::Row>, FlowError>;
}

/// A source that emits an in-memory collection of rows.
pub struct MemorySource<T> {
    name: String,
    rows: Vec<T>,
    output: OutputPort<T>,
    capacity: Capacity,
    started: bool,
}

impl<T: FlowRow> MemorySource<T> {
    /// Creates a source over the given rows, emitted in order.
    #[must_use]
    pub fn new(name: impl Into<String>, rows: impl IntoIterator<Item = T>) -> Self {
        let name = name.into();
        Self {
            output: OutputPort::new(format!("{name}.out")),
            rows: rows.into_iter().collect(),
            name,
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
}

impl<T: FlowRow> LinkSource<T> for MemorySource<T> {
    fn output_port(&self) -> &OutputPort<T> {
        &self.output
    }
}

impl<T: FlowRow> Stage for MemorySource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        self.started = true;

        self.output
            .buffer()
            .set_capacity(self.capacity.resolve(ctx.buffer_capacity()));
        self.output.start_router(ctx, &self.name);
        self.output.buffer().add_producer();

        let rows = std::mem::take(&mut self.rows);
        let output = self.output.buffer().clone();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            for row in rows {
                tokio::select! {
                    () = cancel.cancelled() => {
                        output.fault(StageError::cancelled(&name));
                        return;
                    }
                    pushed = output.push(row) => {
                        if pushed.is_err() {
                            return;
                        }
                    }
                }
            }
            debug!(stage = %name, "source drained");
            output.producer_done();
        });
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.output.completion()
    }
}

/// A source that lazily drains an iterator.
///
/// Unlike [`MemorySource`], items are produced on demand: an expensive or
/// unbounded iterator only advances as fast as downstream consumes.
pub struct IterSource<I: Iterator> {
    name: String,
    iter: Option<I>,
    output: OutputPort<I::Item>,
    capacity: Capacity,
    started: bool,
}

impl<I> IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: FlowRow,
{
    /// Creates a source over the given iterator.
    #[must_use]
    pub fn new(name: impl Into<String>, iter: I) -> Self {
        let name = name.into();
        Self {
            output: OutputPort::new(format!("{name}.out")),
            iter: Some(iter),
            name,
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
}

impl<I> LinkSource<I::Item> for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: FlowRow,
{
    fn output_port(&self) -> &OutputPort<I::Item> {
        &self.output
    }
}

impl<I> Stage for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: FlowRow,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        let Some(iter) = self.iter.take() else {
            return Err(ConfigError::new(&self.name, "iterator already consumed").into());
        };
        self.started = true;

        self.output
            .buffer()
            .set_capacity(self.capacity.resolve(ctx.buffer_capacity()));
        self.output.start_router(ctx, &self.name);
        self.output.buffer().add_producer();

        let output = self.output.buffer().clone();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            for row in iter {
                tokio::select! {
                    () = cancel.cancelled() => {
                        output.fault(StageError::cancelled(&name));
                        return;
                    }
                    pushed = output.push(row) => {
                        if pushed.is_err() {
                            return;
                        }
                    }
                }
            }
            debug!(stage = %name, "source drained");
            output.producer_done();
        });
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.output.completion()
    }
}

/// A source driven by a [`RowProducer`].
pub struct CustomSource<P: RowProducer> {
    name: String,
    producer: Option<P>,
    output: OutputPort<P::Row>,
    capacity: Capacity,
    started: bool,
}

impl<P: RowProducer + 'static> CustomSource<P> {
    /// Creates a source over the given producer.
    #[must_use]
    pub fn new(name: impl Into<String>, producer: P) -> Self {
        let name = name.into();
        Self {
            output: OutputPort::new(format!("{name}.out")),
            producer: Some(producer),
            name,
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
}

impl<P: RowProducer + 'static> LinkSource<P::Row> for CustomSource<P> {
    fn output_port(&self) -> &OutputPort<P::Row> {
        &self.output
    }
}

impl<P: RowProducer + 'static> Stage for CustomSource<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        let Some(mut producer) = self.producer.take() else {
            return Err(ConfigError::new(&self.name, "producer already consumed").into());
        };
        self.started = true;

        self.output
            .buffer()
            .set_capacity(self.capacity.resolve(ctx.buffer_capacity()));
        self.output.start_router(ctx, &self.name);
        self.output.buffer().add_producer();

        let output = self.output.buffer().clone();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => {
                        output.fault(StageError::cancelled(&name));
                        return;
                    }
                    next = producer.next_row() => next,
                };
                match next {
                    Ok(Some(row)) => {
                        if output.push(row).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        output.producer_done();
                        return;
                    }
                    Err(err) => {
                        output.fault(StageError::new(&name, err));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;

    struct Countdown {
        remaining: i64,
    }

    #[async_trait]
    impl RowProducer for Countdown {
        type Row = i64;

        async fn next_row(&mut self) -> Result<Option<i64>, FlowError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(self.remaining))
        }
    }

    #[tokio::test]
    async fn test_memory_source_emits_in_order() {
        let ctx = ExecutionContext::new();
        let mut source = MemorySource::new("src", vec![1i64, 2, 3]);
        let sink: Buffer<i64> = Buffer::new("sink", None);
        source.link_to(&sink);
        source.start(&ctx).unwrap();

        assert_eq!(sink.pop().await.unwrap(), Some(1));
        assert_eq!(sink.pop().await.unwrap(), Some(2));
        assert_eq!(sink.pop().await.unwrap(), Some(3));
        assert_eq!(sink.pop().await.unwrap(), None);
        source.completion().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_iter_source_drains_lazily() {
        let ctx = ExecutionContext::new();
        let mut source = IterSource::new("squares", (1i64..=4).map(|n| n * n));
        let sink: Buffer<i64> = Buffer::new("sink", None);
        source.link_to(&sink);
        source.start(&ctx).unwrap();

        let mut seen = Vec::new();
        while let Some(row) = sink.pop().await.unwrap() {
            seen.push(row);
        }
        assert_eq!(seen, vec![1, 4, 9, 16]);
        source.completion().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_source_pulls_until_end() {
        let ctx = ExecutionContext::new();
        let mut source = CustomSource::new("count", Countdown { remaining: 2 });
        let sink: Buffer<i64> = Buffer::new("sink", None);
        source.link_to(&sink);
        source.start(&ctx).unwrap();

        assert_eq!(sink.pop().await.unwrap(), Some(1));
        assert_eq!(sink.pop().await.unwrap(), Some(0));
        assert_eq!(sink.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancellation_faults_source() {
        let ctx = ExecutionContext::new().with_buffer_capacity(Some(1));
        let mut source = MemorySource::new("src", (0..100i64).collect::<Vec<_>>());
        // A full, never-drained target backs the source up; cancellation
        // must then fault it.
        let sink: Buffer<i64> = Buffer::new("sink", Some(1));
        source.link_to(&sink);
        source.start(&ctx).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        ctx.cancellation().cancel("test");

        let err = source.completion().wait().await.unwrap_err();
        assert_eq!(err.message, "cancelled");
    }

    #[tokio::test]
    async fn test_double_start_is_config_error() {
        let ctx = ExecutionContext::new();
        let mut source = MemorySource::new("src", Vec::<i64>::new());
        source.start(&ctx).unwrap();
        assert!(matches!(source.start(&ctx), Err(FlowError::Config(_))));
    }
}
