//! Execution context threaded through stage construction and startup.
//!
//! Rowflow has no ambient/static pipeline state: everything a stage needs
//! at runtime (cancellation, event sink, sizing defaults) travels in an
//! explicit [`ExecutionContext`] value passed to
//! [`Stage::start`](crate::stages::Stage::start).

use crate::cancellation::CancellationToken;
use crate::events::{EventSink, NoOpEventSink};
use std::sync::Arc;
use uuid::Uuid;

/// Default capacity for stage input and output buffers.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Default batch size for batch transforms and bulk-load destinations.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Explicit execution context for a pipeline run.
///
/// Cloning is cheap; all clones share the same cancellation token and
/// event sink.
#[derive(Clone)]
pub struct ExecutionContext {
    run_id: Uuid,
    cancellation: CancellationToken,
    events: Arc<dyn EventSink>,
    buffer_capacity: Option<usize>,
    batch_size: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl ExecutionContext {
    /// Creates a context with default sizing, a fresh run id, no event
    /// sink, and an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancellation: CancellationToken::new(),
            events: Arc::new(NoOpEventSink),
            buffer_capacity: Some(DEFAULT_BUFFER_CAPACITY),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Sets the default buffer capacity for stages that do not override it.
    ///
    /// `None` means unbounded.
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: Option<usize>) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the default batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Returns the run identity.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the shared cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns true if the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns the default buffer capacity (`None` = unbounded).
    #[must_use]
    pub fn buffer_capacity(&self) -> Option<usize> {
        self.buffer_capacity
    }

    /// Returns the default batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Emits an event without blocking, suppressing any failure.
    pub fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.try_emit(event_type, data);
    }
}
