//! Pipeline stages: sources, transformations, and destinations.
//!
//! Every stage runs as one or more independently scheduled workers that
//! communicate with the rest of the graph exclusively through bounded
//! buffers. A stage is wired first (`link_to`, `link_error_to`), then
//! started with an [`ExecutionContext`](crate::context::ExecutionContext);
//! configuration errors surface synchronously from `start`, never from a
//! worker.

mod batch_transform;
mod block_transform;
mod destination;
mod distinct;
mod error;
mod lookup;
mod merge_join;
mod row_transform;
mod source;

pub use batch_transform::BatchTransform;
pub use block_transform::BlockTransform;
pub use destination::{CustomDestination, MemoryDestination, RowConsumer};
pub use distinct::Distinct;
pub use error::{ErrorPort, ErrorRecord};
pub use lookup::{ColumnMap, Lookup};
pub use merge_join::MergeJoin;
pub use row_transform::RowTransform;
pub use source::{CustomSource, IterSource, MemorySource, RowProducer};

pub(crate) use error::ErrorHandle;

use crate::buffer::{Buffer, Completion};
use crate::context::ExecutionContext;
use crate::errors::FlowError;
use crate::link::LinkTarget;

/// A pipeline node.
///
/// `start` spawns the stage's workers and returns configuration errors
/// synchronously. `completion` resolves once the stage has fully
/// terminated (successfully or with a fault); awaiting every stage's
/// completion - error sinks included - is the whole-graph termination
/// contract.
pub trait Stage: Send {
    /// Returns the stage name.
    fn name(&self) -> &str;

    /// Spawns the stage's workers.
    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError>;

    /// Returns the stage's terminal handle.
    fn completion(&self) -> Completion;
}

/// A cloneable handle to one of a stage's secondary inputs (merge-join
/// sides, lookup side tables).
pub struct InputHandle<T> {
    buffer: Buffer<T>,
}

impl<T> InputHandle<T> {
    pub(crate) fn new(buffer: Buffer<T>) -> Self {
        Self { buffer }
    }
}

impl<T> LinkTarget<T> for InputHandle<T> {
    fn input_buffer(&self) -> Buffer<T> {
        self.buffer.clone()
    }
}

/// Shared type for fallible per-row transformation functions.
///
/// `Ok(None)` drops the row; `Err` is a per-row processing error and is
/// redirected to the stage's error sink if one is linked.
pub type TransformFn<I, O> =
    std::sync::Arc<dyn Fn(I) -> Result<Option<O>, FlowError> + Send + Sync>;

/// One-time async initializer run lazily before the first row.
pub type InitFn = std::sync::Arc<
    dyn Fn() -> futures::future::BoxFuture<'static, Result<(), FlowError>> + Send + Sync,
>;
