//! Two-input joining.

use super::{ErrorHandle, ErrorPort, ErrorRecord, InputHandle, Stage};
use crate::buffer::{Buffer, Capacity, Completion};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::{LinkSource, LinkTarget, OutputPort};
use crate::row::FlowRow;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

type JoinFn<L, R, O> = Arc<dyn Fn(Option<L>, Option<R>) -> Result<O, FlowError> + Send + Sync>;
type CompareFn<L, R> = Arc<dyn Fn(&L, &R) -> Ordering + Send + Sync>;

struct JoinState<L, R> {
    left: VecDeque<L>,
    right: VecDeque<R>,
    left_done: bool,
    right_done: bool,
}

/// Joins two inputs pairwise into one output.
///
/// Without a comparator the inputs are zipped in arrival order; once one
/// side completes, the other side's remaining rows are joined against
/// `None`. With a comparator ([`with_comparator`](Self::with_comparator))
/// both inputs must arrive sorted by the comparator's ordering, and the
/// stage produces a full outer merge: `Equal` joins one row from each
/// side, `Less` emits the left row against `None`, `Greater` emits the
/// right row against `None`.
pub struct MergeJoin<L, R, O> {
    name: String,
    left: Buffer<L>,
    right: Buffer<R>,
    output: OutputPort<O>,
    errors: ErrorPort,
    join: JoinFn<L, R, O>,
    comparator: Option<CompareFn<L, R>>,
    capacity: Capacity,
    started: bool,
}

impl<L: FlowRow, R: FlowRow, O: FlowRow> MergeJoin<L, R, O> {
    /// Creates a zip join from a pairing function.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        join: impl Fn(Option<L>, Option<R>) -> Result<O, FlowError> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            left: Buffer::new(format!("{name}.left"), None),
            right: Buffer::new(format!("{name}.right"), None),
            output: OutputPort::new(format!("{name}.out")),
            errors: ErrorPort::new(&name),
            name,
            join: Arc::new(join),
            comparator: None,
            capacity: Capacity::Default,
            started: false,
        }
    }

    /// Switches to sorted-merge semantics under the given ordering.
    #[must_use]
    pub fn with_comparator(
        mut self,
        compare: impl Fn(&L, &R) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.comparator = Some(Arc::new(compare));
        self
    }

    /// Overrides the buffer capacity for this stage's buffers.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Links the error output to a sink; a failing join call is
    /// redirected there instead of faulting the stage.
    pub fn link_error_to<D: LinkTarget<ErrorRecord> + ?Sized>(&mut self, sink: &D) {
        self.errors.link_to(sink);
    }

    /// Returns the left input.
    #[must_use]
    pub fn left_port(&self) -> InputHandle<L> {
        InputHandle::new(self.left.clone())
    }

    /// Returns the right input.
    #[must_use]
    pub fn right_port(&self) -> InputHandle<R> {
        InputHandle::new(self.right.clone())
    }
}

struct Shared<L, R, O> {
    name: String,
    state: Mutex<JoinState<L, R>>,
    left: Buffer<L>,
    right: Buffer<R>,
    output: Buffer<O>,
    errors: ErrorHandle,
    join: JoinFn<L, R, O>,
    comparator: Option<CompareFn<L, R>>,
}

impl<L: FlowRow, R: FlowRow, O: FlowRow> Shared<L, R, O> {
    fn fault_all(&self, err: &StageError) {
        self.left.fault(err.clone());
        self.right.fault(err.clone());
        self.output.fault(err.clone());
        self.errors.fault(err.clone());
    }

    /// Joins one pairing; false stops the pump.
    async fn emit(&self, left: Option<L>, right: Option<R>) -> bool {
        let snapshot = self
            .errors
            .is_linked()
            .then(|| json!({ "left": &left, "right": &right }));
        match (self.join)(left, right) {
            Ok(row) => {
                if self.output.push(row).await.is_err() {
                    self.fault_all(&StageError::new(&self.name, "downstream terminated"));
                    return false;
                }
                true
            }
            Err(err) => {
                if let Some(snapshot) = snapshot {
                    if self.errors.redirect(err.to_string(), &snapshot).await.is_ok() {
                        return true;
                    }
                }
                self.fault_all(&StageError::new(&self.name, &err));
                false
            }
        }
    }

    /// Emits every pairing currently decidable; false stops the pump.
    ///
    /// The state lock is held across output pushes on purpose: pairings
    /// must be decided and emitted atomically or the two pumps would
    /// interleave their steps.
    async fn drain_ready(&self) -> bool {
        let mut state = self.state.lock().await;
        loop {
            let step = match &self.comparator {
                Some(compare) => match (state.left.front(), state.right.front()) {
                    (Some(l), Some(r)) => Some(compare(l, r)),
                    (Some(_), None) if state.right_done => Some(Ordering::Less),
                    (None, Some(_)) if state.left_done => Some(Ordering::Greater),
                    _ => None,
                },
                None => match (state.left.is_empty(), state.right.is_empty()) {
                    (false, false) => Some(Ordering::Equal),
                    (false, true) if state.right_done => Some(Ordering::Less),
                    (true, false) if state.left_done => Some(Ordering::Greater),
                    _ => None,
                },
            };
            match step {
                Some(Ordering::Equal) => {
                    let l = state.left.pop_front();
                    let r = state.right.pop_front();
                    if !self.emit(l, r).await {
                        return false;
                    }
                }
                Some(Ordering::Less) => {
                    let l = state.left.pop_front();
                    if !self.emit(l, None).await {
                        return false;
                    }
                }
                Some(Ordering::Greater) => {
                    let r = state.right.pop_front();
                    if !self.emit(None, r).await {
                        return false;
                    }
                }
                None => return true,
            }
        }
    }
}

impl<L: FlowRow, R: FlowRow, O: FlowRow> LinkSource<O> for MergeJoin<L, R, O> {
    fn output_port(&self) -> &OutputPort<O> {
        &self.output
    }
}

impl<L: FlowRow, R: FlowRow, O: FlowRow> Stage for MergeJoin<L, R, O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        self.started = true;

        let capacity = self.capacity.resolve(ctx.buffer_capacity());
        self.left.set_capacity(capacity);
        self.right.set_capacity(capacity);
        self.output.buffer().set_capacity(capacity);
        self.output.start_router(ctx, &self.name);
        self.errors.start(ctx);

        let shared = Arc::new(Shared {
            name: self.name.clone(),
            state: Mutex::new(JoinState {
                left: VecDeque::new(),
                right: VecDeque::new(),
                left_done: false,
                right_done: false,
            }),
            left: self.left.clone(),
            right: self.right.clone(),
            output: self.output.buffer().clone(),
            errors: self.errors.handle(),
            join: Arc::clone(&self.join),
            comparator: self.comparator.clone(),
        });

        // Left pump.
        {
            self.output.buffer().add_producer();
            self.errors.add_producer();
            let shared = Arc::clone(&shared);
            let cancel = ctx.cancellation().clone();
            tokio::spawn(async move {
                loop {
                    let popped = tokio::select! {
                        () = cancel.cancelled() => {
                            shared.fault_all(&StageError::cancelled(&shared.name));
                            return;
                        }
                        popped = shared.left.pop() => popped,
                    };
                    match popped {
                        Ok(Some(row)) => {
                            shared.state.lock().await.left.push_back(row);
                            if !shared.drain_ready().await {
                                return;
                            }
                        }
                        Ok(None) => {
                            shared.state.lock().await.left_done = true;
                            if shared.drain_ready().await {
                                shared.output.producer_done();
                                shared.errors.producer_done();
                            }
                            return;
                        }
                        Err(err) => {
                            shared.fault_all(&err);
                            return;
                        }
                    }
                }
            });
        }

        // Right pump.
        {
            self.output.buffer().add_producer();
            self.errors.add_producer();
            let cancel = ctx.cancellation().clone();
            tokio::spawn(async move {
                loop {
                    let popped = tokio::select! {
                        () = cancel.cancelled() => {
                            shared.fault_all(&StageError::cancelled(&shared.name));
                            return;
                        }
                        popped = shared.right.pop() => popped,
                    };
                    match popped {
                        Ok(Some(row)) => {
                            shared.state.lock().await.right.push_back(row);
                            if !shared.drain_ready().await {
                                return;
                            }
                        }
                        Ok(None) => {
                            shared.state.lock().await.right_done = true;
                            if shared.drain_ready().await {
                                shared.output.producer_done();
                                shared.errors.producer_done();
                            }
                            return;
                        }
                        Err(err) => {
                            shared.fault_all(&err);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::MemorySource;

    async fn drain<T: FlowRow>(buffer: &Buffer<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(row) = buffer.pop().await.unwrap() {
            out.push(row);
        }
        out
    }

    fn pair(l: Option<i64>, r: Option<i64>) -> Result<(Option<i64>, Option<i64>), FlowError> {
        Ok((l, r))
    }

    #[tokio::test]
    async fn test_sorted_merge_is_a_full_outer_join() {
        let ctx = ExecutionContext::new();
        let mut left_src = MemorySource::new("left", vec![1i64, 3]);
        let mut right_src = MemorySource::new("right", vec![1i64, 2]);
        let mut join = MergeJoin::new("join", pair).with_comparator(|l: &i64, r: &i64| l.cmp(r));
        let sink: Buffer<(Option<i64>, Option<i64>)> = Buffer::new("sink", None);
        left_src.link_to(&join.left_port());
        right_src.link_to(&join.right_port());
        join.link_to(&sink);
        left_src.start(&ctx).unwrap();
        right_src.start(&ctx).unwrap();
        join.start(&ctx).unwrap();

        let rows = drain(&sink).await;
        // 1 pairs with 1; right 2 has no left partner while left's head
        // is 3; left 3 flushes once the right side is exhausted.
        assert_eq!(
            rows,
            vec![(Some(1), Some(1)), (None, Some(2)), (Some(3), None)]
        );
        join.completion().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_equal_keys_pair_one_to_one() {
        let ctx = ExecutionContext::new();
        let mut left_src = MemorySource::new("left", vec![1i64, 1, 2]);
        let mut right_src = MemorySource::new("right", vec![1i64, 2, 2]);
        let mut join = MergeJoin::new("join", pair).with_comparator(|l: &i64, r: &i64| l.cmp(r));
        let sink: Buffer<(Option<i64>, Option<i64>)> = Buffer::new("sink", None);
        left_src.link_to(&join.left_port());
        right_src.link_to(&join.right_port());
        join.link_to(&sink);
        left_src.start(&ctx).unwrap();
        right_src.start(&ctx).unwrap();
        join.start(&ctx).unwrap();

        let rows = drain(&sink).await;
        // Equal keys pair one-to-one: (1,1), then the second left 1 is
        // less than right 2, then (2,2), then the last right 2 drains.
        assert_eq!(
            rows,
            vec![
                (Some(1), Some(1)),
                (Some(1), None),
                (Some(2), Some(2)),
                (None, Some(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_zip_mode_pairs_in_arrival_order() {
        let ctx = ExecutionContext::new();
        let mut left_src = MemorySource::new("left", vec![10i64, 20, 30]);
        let mut right_src = MemorySource::new("right", vec![1i64]);
        let mut join = MergeJoin::new("zip", pair);
        let sink: Buffer<(Option<i64>, Option<i64>)> = Buffer::new("sink", None);
        left_src.link_to(&join.left_port());
        right_src.link_to(&join.right_port());
        join.link_to(&sink);
        left_src.start(&ctx).unwrap();
        right_src.start(&ctx).unwrap();
        join.start(&ctx).unwrap();

        let rows = drain(&sink).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (Some(10), Some(1)));
        assert_eq!(rows[1], (Some(20), None));
        assert_eq!(rows[2], (Some(30), None));
    }

    #[tokio::test]
    async fn test_join_error_redirects_when_linked() {
        let ctx = ExecutionContext::new();
        let mut left_src = MemorySource::new("left", vec![1i64, 2]);
        let mut right_src = MemorySource::new("right", vec![1i64, 2]);
        let mut join = MergeJoin::new("picky", |l: Option<i64>, r: Option<i64>| {
            if l == Some(2) {
                return Err(FlowError::processing("two is not joinable"));
            }
            Ok((l, r))
        })
        .with_comparator(|l: &i64, r: &i64| l.cmp(r));
        let sink: Buffer<(Option<i64>, Option<i64>)> = Buffer::new("sink", None);
        let errs: Buffer<ErrorRecord> = Buffer::new("errs", None);
        left_src.link_to(&join.left_port());
        right_src.link_to(&join.right_port());
        join.link_to(&sink);
        join.link_error_to(&errs);
        left_src.start(&ctx).unwrap();
        right_src.start(&ctx).unwrap();
        join.start(&ctx).unwrap();

        assert_eq!(drain(&sink).await, vec![(Some(1), Some(1))]);
        let records = drain(&errs).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].row_json.contains("\"left\":2"));
    }

    #[tokio::test]
    async fn test_join_error_faults_both_inputs_when_unlinked() {
        let ctx = ExecutionContext::new();
        let mut join: MergeJoin<i64, i64, i64> =
            MergeJoin::new("strict", |_, _| Err(FlowError::processing("never")));
        let sink: Buffer<i64> = Buffer::new("sink", None);
        join.link_to(&sink);
        join.start(&ctx).unwrap();

        let left = join.left_port().input_buffer();
        let right = join.right_port().input_buffer();
        left.push(1).await.unwrap();
        right.push(1).await.unwrap();

        let err = join.completion().wait().await.unwrap_err();
        assert!(err.message.contains("never"));
        assert!(left.is_faulted());
        assert!(right.is_faulted());
    }
}
