//! Pipeline lifecycle events.
//!
//! Stages emit lifecycle events (`stage.started`, `stage.completed`,
//! `stage.faulted`, ...) through an [`EventSink`] carried by the
//! execution context. Event emission is observability-only and never
//! fails the pipeline.

mod sink;

pub use sink::{EventSink, LoggingEventSink, NoOpEventSink};
