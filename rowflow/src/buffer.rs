//! The bounded tri-state buffer connecting stages.
//!
//! A [`Buffer`] is an asynchronous, capacity-bounded FIFO with three
//! states: Open, Completed, Faulted. `push` suspends the producer while
//! the buffer is at capacity (backpressure); `pop` suspends the consumer
//! while the buffer is empty and still Open. Terminal states are
//! irreversible: completing stops further enqueues but lets queued items
//! drain, faulting discards undelivered items immediately.
//!
//! Producer accounting lives here too: every upstream link registers as a
//! producer, and the buffer transitions to Completed only when the last
//! producer finishes. This is the AND-join that makes fan-in completion
//! correct.

use crate::errors::StageError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Capacity configuration for a stage's buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Capacity {
    /// Use the execution context's default.
    #[default]
    Default,
    /// A fixed bound.
    Bounded(usize),
    /// No bound (the unbounded sentinel).
    Unbounded,
}

impl Capacity {
    /// Resolves against the context default. `None` means unbounded.
    #[must_use]
    pub fn resolve(self, context_default: Option<usize>) -> Option<usize> {
        match self {
            Self::Default => context_default,
            Self::Bounded(n) => Some(n),
            Self::Unbounded => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Open,
    Completed,
    Faulted(StageError),
}

#[derive(Debug, Clone)]
enum CompletionState {
    Pending,
    Done,
    Faulted(StageError),
}

struct State<T> {
    queue: VecDeque<T>,
    capacity: Option<usize>,
    phase: Phase,
    producers: usize,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    // Bumped on every mutation; push/pop waiters subscribe and re-check.
    pulse: watch::Sender<u64>,
    completion: watch::Sender<CompletionState>,
}

/// A bounded FIFO of rows with completion/fault semantics.
///
/// Cloning the handle shares the underlying queue.
pub struct Buffer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Buffer")
            .field("name", &self.inner.name)
            .field("len", &state.queue.len())
            .field("capacity", &state.capacity)
            .field("producers", &state.producers)
            .finish()
    }
}

impl<T: Send> Buffer<T> {
    /// Creates a buffer. `capacity = None` is the unbounded sentinel.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: Option<usize>) -> Self {
        let (pulse, _) = watch::channel(0);
        let (completion, _) = watch::channel(CompletionState::Pending);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    capacity,
                    phase: Phase::Open,
                    producers: 0,
                }),
                pulse,
                completion,
            }),
        }
    }

    /// Returns the buffer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Replaces the capacity. Called by stages at startup to apply the
    /// context default; has no effect on items already queued.
    pub(crate) fn set_capacity(&self, capacity: Option<usize>) {
        self.inner.state.lock().capacity = capacity;
        self.tick();
    }

    /// Returns the current queue length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Returns true if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().queue.is_empty()
    }

    /// Returns true once the buffer reached Completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Completed)
    }

    /// Returns true once the buffer reached Faulted.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Faulted(_))
    }

    /// Enqueues an item, suspending while the buffer is at capacity.
    ///
    /// Fails once the buffer is Completed or Faulted; enqueue after a
    /// terminal transition is illegal.
    pub async fn push(&self, item: T) -> Result<(), StageError> {
        let mut slot = Some(item);
        let mut rx = self.inner.pulse.subscribe();
        loop {
            {
                let mut state = self.inner.state.lock();
                match &state.phase {
                    Phase::Faulted(err) => return Err(err.clone()),
                    Phase::Completed => {
                        return Err(StageError::new(
                            &self.inner.name,
                            "enqueue after completion",
                        ))
                    }
                    Phase::Open => {}
                }
                if state.capacity.map_or(true, |c| state.queue.len() < c) {
                    if let Some(item) = slot.take() {
                        state.queue.push_back(item);
                    }
                    drop(state);
                    self.tick();
                    return Ok(());
                }
            }
            if rx.changed().await.is_err() {
                return Err(StageError::new(&self.inner.name, "buffer dropped"));
            }
        }
    }

    /// Dequeues the next item.
    ///
    /// Suspends while the buffer is empty and Open. Returns `Ok(None)`
    /// once the buffer is Completed and drained; surfaces the fault error
    /// once Faulted.
    pub async fn pop(&self) -> Result<Option<T>, StageError> {
        let mut rx = self.inner.pulse.subscribe();
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    drop(state);
                    self.tick();
                    return Ok(Some(item));
                }
                match &state.phase {
                    Phase::Faulted(err) => return Err(err.clone()),
                    Phase::Completed => return Ok(None),
                    Phase::Open => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(StageError::new(&self.inner.name, "buffer dropped"));
            }
        }
    }

    /// Registers a producer. The buffer completes only after every
    /// registered producer has called [`Buffer::producer_done`].
    pub fn add_producer(&self) {
        self.inner.state.lock().producers += 1;
    }

    /// Returns the number of registered, unfinished producers.
    pub(crate) fn producer_count(&self) -> usize {
        self.inner.state.lock().producers
    }

    /// Marks one producer as finished; the last one completes the buffer.
    pub fn producer_done(&self) {
        let complete = {
            let mut state = self.inner.state.lock();
            state.producers = state.producers.saturating_sub(1);
            state.producers == 0 && matches!(state.phase, Phase::Open)
        };
        if complete {
            self.complete();
        }
    }

    /// Transitions Open -> Completed. Queued items remain poppable.
    ///
    /// No-op if the buffer already reached a terminal state.
    pub fn complete(&self) {
        {
            let mut state = self.inner.state.lock();
            if !matches!(state.phase, Phase::Open) {
                return;
            }
            state.phase = Phase::Completed;
        }
        self.inner.completion.send_replace(CompletionState::Done);
        self.tick();
    }

    /// Transitions to Faulted, discarding undelivered items.
    ///
    /// Idempotent: only the first fault is retained. A Completed buffer
    /// may still fault (e.g. downstream consumption failed).
    pub fn fault(&self, error: StageError) {
        {
            let mut state = self.inner.state.lock();
            if matches!(state.phase, Phase::Faulted(_)) {
                return;
            }
            state.queue.clear();
            state.phase = Phase::Faulted(error.clone());
        }
        self.inner
            .completion
            .send_replace(CompletionState::Faulted(error));
        self.tick();
    }

    /// Returns a handle resolving when the buffer reaches a terminal
    /// state: `Ok(())` for Completed, the fault error for Faulted.
    #[must_use]
    pub fn completion(&self) -> Completion {
        Completion {
            rx: self.inner.completion.subscribe(),
        }
    }

    fn tick(&self) {
        self.inner.pulse.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// A cloneable handle that resolves when a buffer (or stage) terminates.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<CompletionState>,
}

impl Completion {
    /// Waits for the terminal transition.
    ///
    /// Each caller observes the outcome exactly once; a fault carries the
    /// original error.
    pub async fn wait(mut self) -> Result<(), StageError> {
        loop {
            let snapshot = self.rx.borrow().clone();
            match snapshot {
                CompletionState::Pending => {}
                CompletionState::Done => return Ok(()),
                CompletionState::Faulted(err) => return Err(err),
            }
            if self.rx.changed().await.is_err() {
                return Err(StageError::new("completion", "signal dropped while pending"));
            }
        }
    }

    /// Returns true if the handle already settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(*self.rx.borrow(), CompletionState::Pending)
    }
}

/// A standalone completion signal for stages without an output buffer
/// (destinations).
#[derive(Clone)]
pub(crate) struct CompletionCell {
    tx: watch::Sender<CompletionState>,
}

impl CompletionCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(CompletionState::Pending);
        Self { tx }
    }

    pub(crate) fn handle(&self) -> Completion {
        Completion {
            rx: self.tx.subscribe(),
        }
    }

    /// Resolves the handle successfully. First terminal transition wins.
    pub(crate) fn done(&self) {
        self.tx.send_if_modified(|state| {
            if matches!(state, CompletionState::Pending) {
                *state = CompletionState::Done;
                true
            } else {
                false
            }
        });
    }

    /// Resolves the handle with a fault. First terminal transition wins.
    pub(crate) fn fault(&self, error: StageError) {
        self.tx.send_if_modified(|state| {
            if matches!(state, CompletionState::Pending) {
                *state = CompletionState::Faulted(error);
                true
            } else {
                false
            }
        });
    }
}
