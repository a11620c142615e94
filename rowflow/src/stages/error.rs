//! Per-record error redirection.
//!
//! A stage with a linked error sink captures a failing row together with
//! a serialized snapshot and keeps running; without one, the first
//! per-row error faults the stage and the fault propagates downstream.

use crate::buffer::Buffer;
use crate::context::ExecutionContext;
use crate::errors::StageError;
use crate::link::{LinkTarget, OutputPort};
use serde::{Deserialize, Serialize};

/// A captured per-row failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The stage where the row failed.
    pub stage: String,
    /// The flattened error message.
    pub message: String,
    /// JSON snapshot of the failing row (or batch).
    pub row_json: String,
}

/// The error output of a stage.
pub struct ErrorPort {
    stage: String,
    port: OutputPort<ErrorRecord>,
    linked: bool,
}

impl ErrorPort {
    pub(crate) fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            port: OutputPort::new(format!("{stage}.errors")),
            linked: false,
        }
    }

    /// Links the error output to a sink accepting [`ErrorRecord`]s.
    pub fn link_to<D: LinkTarget<ErrorRecord> + ?Sized>(&mut self, sink: &D) {
        self.port.link(sink.input_buffer(), None);
        self.linked = true;
    }

    pub(crate) fn start(&self, ctx: &ExecutionContext) {
        self.port.start_router(ctx, &self.stage);
    }

    pub(crate) fn add_producer(&self) {
        self.port.buffer().add_producer();
    }

    pub(crate) fn handle(&self) -> ErrorHandle {
        ErrorHandle {
            stage: self.stage.clone(),
            buffer: self.port.buffer().clone(),
            linked: self.linked,
        }
    }
}

impl std::fmt::Debug for ErrorPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorPort")
            .field("stage", &self.stage)
            .field("linked", &self.linked)
            .finish()
    }
}

/// Worker-side handle to a stage's error output.
#[derive(Clone)]
pub(crate) struct ErrorHandle {
    stage: String,
    buffer: Buffer<ErrorRecord>,
    linked: bool,
}

impl ErrorHandle {
    /// Returns true if an error sink is linked; without one, per-row
    /// errors fault the stage instead.
    pub(crate) fn is_linked(&self) -> bool {
        self.linked
    }

    /// Pushes a captured failure to the error sink.
    pub(crate) async fn redirect<R: serde::Serialize>(
        &self,
        message: impl Into<String>,
        row: &R,
    ) -> Result<(), StageError> {
        let record = ErrorRecord {
            stage: self.stage.clone(),
            message: message.into(),
            row_json: snapshot_json(row),
        };
        self.buffer.push(record).await
    }

    pub(crate) fn fault(&self, error: StageError) {
        self.buffer.fault(error);
    }

    pub(crate) fn producer_done(&self) {
        self.buffer.producer_done();
    }
}

/// Serializes a row for an error record, degrading gracefully when the
/// row cannot be serialized.
pub(crate) fn snapshot_json<R: serde::Serialize>(row: &R) -> String {
    serde_json::to_string(row).unwrap_or_else(|err| format!("<unserializable row: {err}>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::DynamicRow;

    #[tokio::test]
    async fn test_redirect_captures_snapshot() {
        let mut port = ErrorPort::new("transform");
        let sink: Buffer<ErrorRecord> = Buffer::new("sink", None);
        port.link_to(&sink);
        port.start(&ExecutionContext::new());
        port.add_producer();

        let handle = port.handle();
        assert!(handle.is_linked());

        let row = DynamicRow::new().with("id", 1i64);
        handle.redirect("bad value", &row).await.unwrap();
        handle.producer_done();

        let record = sink.pop().await.unwrap().unwrap();
        assert_eq!(record.stage, "transform");
        assert_eq!(record.message, "bad value");
        assert!(record.row_json.contains("id"));
        assert_eq!(sink.pop().await.unwrap(), None);
    }

    #[test]
    fn test_unlinked_port() {
        let port = ErrorPort::new("s");
        assert!(!port.handle().is_linked());
    }
}
