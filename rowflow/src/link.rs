//! The linking fabric connecting stage outputs to stage inputs.
//!
//! A link is an edge `(output port, predicate | none, target buffer)`.
//! Rows are delivered to the first target whose predicate accepts them in
//! registration order (first-match semantics), or to every target when no
//! predicates are used (broadcast). A row matching no link is silently
//! dropped; callers needing exhaustiveness register a catch-all link.
//!
//! Completion and fault transitions ride the same edges: upstream
//! completion releases one producer on every target (AND-join), an
//! upstream fault propagates to every target immediately (OR, short
//! circuit). Faults flow downstream only.

use crate::buffer::{Buffer, Completion};
use crate::context::ExecutionContext;
use crate::errors::StageError;
use crate::row::FlowRow;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Predicate deciding whether a link accepts a row.
pub type RowPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Link<T> {
    predicate: Option<RowPredicate<T>>,
    target: Buffer<T>,
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            target: self.target.clone(),
        }
    }
}

/// A stage's output: a buffer plus the ordered list of registered links.
///
/// The owning stage pushes rows into the buffer; a router task drains it
/// and delivers rows along the links.
pub struct OutputPort<T> {
    buffer: Buffer<T>,
    links: Arc<Mutex<Vec<Link<T>>>>,
}

impl<T: FlowRow> OutputPort<T> {
    /// Creates a port with an unbounded buffer; stages apply the resolved
    /// capacity at startup.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            buffer: Buffer::new(name, None),
            links: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the port's buffer.
    #[must_use]
    pub fn buffer(&self) -> &Buffer<T> {
        &self.buffer
    }

    /// Returns a terminal handle for the port's buffer.
    #[must_use]
    pub fn completion(&self) -> Completion {
        self.buffer.completion()
    }

    /// Returns the number of registered links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Registers an edge to a target buffer.
    ///
    /// Registration order is delivery-priority order for predicate links.
    /// The target gains one producer, released when this port completes.
    pub fn link(&self, target: Buffer<T>, predicate: Option<RowPredicate<T>>) {
        target.add_producer();
        self.links.lock().push(Link { predicate, target });
    }

    /// Spawns the router task draining this port.
    ///
    /// Links registered after startup are not observed; graphs are wired
    /// before they run.
    pub(crate) fn start_router(&self, ctx: &ExecutionContext, stage: &str) {
        let buffer = self.buffer.clone();
        let links: Vec<Link<T>> = self.links.lock().clone();
        let cancel = ctx.cancellation().clone();
        let stage = stage.to_string();

        tokio::spawn(async move {
            let any_predicate = links.iter().any(|l| l.predicate.is_some());
            loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => {
                        let err = StageError::cancelled(&stage);
                        buffer.fault(err.clone());
                        for link in &links {
                            link.target.fault(err.clone());
                        }
                        return;
                    }
                    popped = buffer.pop() => popped,
                };

                match popped {
                    Ok(Some(row)) => {
                        if links.is_empty() {
                            trace!(stage = %stage, "row dropped: port has no links");
                            continue;
                        }
                        if any_predicate {
                            // First-match; a predicate-less link is a catch-all.
                            let matched = links
                                .iter()
                                .find(|l| l.predicate.as_ref().map_or(true, |p| p(&row)));
                            match matched {
                                Some(link) => {
                                    // Push into a faulted target is a no-op; the
                                    // fault already owns that branch.
                                    let _ = link.target.push(row).await;
                                }
                                None => {
                                    trace!(stage = %stage, "row dropped: no link matched");
                                }
                            }
                        } else {
                            for link in &links {
                                let _ = link.target.push(row.clone()).await;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(stage = %stage, "output completed, releasing targets");
                        for link in &links {
                            link.target.producer_done();
                        }
                        return;
                    }
                    Err(err) => {
                        debug!(stage = %stage, error = %err, "output faulted, propagating");
                        for link in &links {
                            link.target.fault(err.clone());
                        }
                        return;
                    }
                }
            }
        });
    }
}

impl<T> std::fmt::Debug for OutputPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("links", &self.links.lock().len())
            .finish()
    }
}

/// A stage that accepts rows of type `T`.
pub trait LinkTarget<T> {
    /// Returns a handle to the stage's input buffer.
    fn input_buffer(&self) -> Buffer<T>;
}

/// Raw buffers are linkable directly; useful for custom graph plumbing.
impl<T: Send> LinkTarget<T> for Buffer<T> {
    fn input_buffer(&self) -> Buffer<T> {
        self.clone()
    }
}

/// A stage that produces rows of type `T`.
pub trait LinkSource<T: FlowRow> {
    /// Returns the stage's output port.
    fn output_port(&self) -> &OutputPort<T>;

    /// Links this stage's output to a target stage's input.
    fn link_to<D: LinkTarget<T> + ?Sized>(&self, next: &D) {
        self.output_port().link(next.input_buffer(), None);
    }

    /// Links with a predicate; evaluated in registration order, first
    /// match wins.
    fn link_to_if<D: LinkTarget<T> + ?Sized>(
        &self,
        next: &D,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) {
        self.output_port()
            .link(next.input_buffer(), Some(Arc::new(predicate)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new()
    }

    #[tokio::test]
    async fn test_broadcast_without_predicates() {
        let port: OutputPort<i64> = OutputPort::new("out");
        let a: Buffer<i64> = Buffer::new("a", None);
        let b: Buffer<i64> = Buffer::new("b", None);
        port.link(a.clone(), None);
        port.link(b.clone(), None);
        port.start_router(&ctx(), "s");

        port.buffer().push(1).await.unwrap();
        port.buffer().push(2).await.unwrap();
        port.buffer().complete();

        assert_eq!(a.pop().await.unwrap(), Some(1));
        assert_eq!(a.pop().await.unwrap(), Some(2));
        assert_eq!(a.pop().await.unwrap(), None);
        assert_eq!(b.pop().await.unwrap(), Some(1));
        assert_eq!(b.pop().await.unwrap(), Some(2));
        assert_eq!(b.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_match_routing() {
        let port: OutputPort<i64> = OutputPort::new("out");
        let evens: Buffer<i64> = Buffer::new("evens", None);
        let rest: Buffer<i64> = Buffer::new("rest", None);
        port.link(evens.clone(), Some(Arc::new(|v: &i64| v % 2 == 0)));
        port.link(rest.clone(), None);
        port.start_router(&ctx(), "s");

        for v in 1..=4 {
            port.buffer().push(v).await.unwrap();
        }
        port.buffer().complete();

        assert_eq!(evens.pop().await.unwrap(), Some(2));
        assert_eq!(evens.pop().await.unwrap(), Some(4));
        assert_eq!(evens.pop().await.unwrap(), None);
        assert_eq!(rest.pop().await.unwrap(), Some(1));
        assert_eq!(rest.pop().await.unwrap(), Some(3));
        assert_eq!(rest.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unmatched_rows_are_dropped() {
        let port: OutputPort<i64> = OutputPort::new("out");
        let evens: Buffer<i64> = Buffer::new("evens", None);
        port.link(evens.clone(), Some(Arc::new(|v: &i64| v % 2 == 0)));
        port.start_router(&ctx(), "s");

        port.buffer().push(1).await.unwrap();
        port.buffer().push(2).await.unwrap();
        port.buffer().complete();

        assert_eq!(evens.pop().await.unwrap(), Some(2));
        assert_eq!(evens.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fan_in_completion_is_and_join() {
        let left: OutputPort<i64> = OutputPort::new("left");
        let right: OutputPort<i64> = OutputPort::new("right");
        let target: Buffer<i64> = Buffer::new("t", None);
        left.link(target.clone(), None);
        right.link(target.clone(), None);
        left.start_router(&ctx(), "left");
        right.start_router(&ctx(), "right");

        left.buffer().complete();
        // One upstream done is not enough.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!target.is_completed());

        right.buffer().complete();
        target.completion().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_propagates_to_all_targets() {
        let port: OutputPort<i64> = OutputPort::new("out");
        let a: Buffer<i64> = Buffer::new("a", None);
        let b: Buffer<i64> = Buffer::new("b", None);
        port.link(a.clone(), None);
        port.link(b.clone(), None);
        port.start_router(&ctx(), "s");

        port.buffer().fault(StageError::new("s", "boom"));

        assert!(a.completion().wait().await.is_err());
        assert!(b.completion().wait().await.is_err());
    }
}
