#![forbid(unsafe_code)]

//! Thread-bound platform event source serviced by the nested pump.
//!
//! The [`Dispatcher`] stands in for the windowing layer's own event loop:
//! callbacks posted from any thread (redraw requests, input, continuations)
//! and timers land here, and the worker thread runs them whenever a nested
//! pump is active. Actions reach the dispatcher of the thread they run on
//! through [`Dispatcher::current`].
//!
//! # Wakeups
//!
//! Every event that should make a parked pump re-check its state goes
//! through [`DispatcherHandle::wake`] (or a post). Wakeups are sticky: a
//! signal raised while the pump is busy is consumed by its next wait, so a
//! wakeup cannot fall between the pump's last check and it parking.

use crate::error::panic_message;
use crate::sync::{lock, wait, wait_timeout};
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A callback queued on the dispatcher.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: RefCell<Option<DispatcherHandle>> = const { RefCell::new(None) };
}

struct Timer {
    /// `None` when the delay overflows the clock; such a timer never fires.
    due: Option<Instant>,
    seq: u64,
    callback: Callback,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the max-heap pops the earliest deadline first; ties keep
    // posting order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        let by_due = match (self.due, other.due) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => CmpOrdering::Greater,
            (None, Some(_)) => CmpOrdering::Less,
            (None, None) => CmpOrdering::Equal,
        };
        by_due.then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DispatcherState {
    posted: VecDeque<Callback>,
    timers: BinaryHeap<Timer>,
    next_seq: u64,
    signaled: bool,
}

impl DispatcherState {
    fn next_due(&self) -> Option<Instant> {
        self.timers.peek().and_then(|t| t.due)
    }

    fn has_ready(&self, now: Instant) -> bool {
        !self.posted.is_empty() || self.next_due().is_some_and(|due| due <= now)
    }
}

struct DispatcherShared {
    state: Mutex<DispatcherState>,
    cvar: Condvar,
    callbacks_run: AtomicU64,
    callbacks_panicked: AtomicU64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cross-thread handle for posting work to a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<DispatcherShared>,
}

impl DispatcherHandle {
    /// Queue a callback to run on the dispatcher thread at the next pump turn.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        lock(&self.shared.state)
            .posted
            .push_back(Box::new(callback));
        self.shared.cvar.notify_all();
    }

    /// Queue a callback to run once `delay` has elapsed.
    ///
    /// A delay too large to express as a deadline arms a timer that never
    /// fires; it still counts toward [`pending_count`](Self::pending_count).
    pub fn post_after(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = lock(&self.shared.state);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.timers.push(Timer {
                due: Instant::now().checked_add(delay),
                seq,
                callback: Box::new(callback),
            });
        }
        self.shared.cvar.notify_all();
    }

    /// Nudge a parked pump so it re-checks its frame and idle sources.
    pub fn wake(&self) {
        lock(&self.shared.state).signaled = true;
        self.shared.cvar.notify_all();
    }

    /// Number of posted callbacks plus armed timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let state = lock(&self.shared.state);
        state.posted.len() + state.timers.len()
    }

    /// Whether both handles refer to the same dispatcher.
    #[must_use]
    pub fn same_dispatcher(&self, other: &DispatcherHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// The worker thread's event source.
///
/// Cloning shares the same queue; only the owning worker thread should run
/// callbacks ([`run_pending`](Self::run_pending)) or park on it.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                state: Mutex::new(DispatcherState {
                    posted: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    next_seq: 0,
                    signaled: false,
                }),
                cvar: Condvar::new(),
                callbacks_run: AtomicU64::new(0),
                callbacks_panicked: AtomicU64::new(0),
            }),
        }
    }

    /// Handle usable from any thread.
    #[must_use]
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Handle to the dispatcher serving the calling thread, if any.
    ///
    /// Inside a dispatched action this is the session's dispatcher.
    #[must_use]
    pub fn current() -> Option<DispatcherHandle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Make this dispatcher [`current`](Self::current) for the calling thread
    /// until the guard drops.
    #[must_use = "the dispatcher is only current while the guard lives"]
    pub fn install(&self) -> InstallGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(self.handle()));
        InstallGuard { previous }
    }

    /// Drop all posted callbacks and timers and clear any pending signal.
    pub fn reset(&self) {
        let (posted, timers) = {
            let mut state = lock(&self.shared.state);
            state.signaled = false;
            (
                std::mem::take(&mut state.posted),
                std::mem::take(&mut state.timers),
            )
        };
        if !posted.is_empty() || !timers.is_empty() {
            tracing::trace!(
                posted = posted.len(),
                timers = timers.len(),
                "dispatcher reset dropped pending callbacks"
            );
        }
    }

    /// Run every posted callback queued so far plus every due timer.
    ///
    /// Callbacks posted while the batch runs wait for the next turn. A
    /// panicking callback is logged and does not stop the batch. Returns
    /// the number of callbacks run.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<Callback> = {
            let mut state = lock(&self.shared.state);
            let now = Instant::now();
            let mut batch = Vec::new();
            while state.next_due().is_some_and(|due| due <= now) {
                if let Some(timer) = state.timers.pop() {
                    batch.push(timer.callback);
                }
            }
            batch.extend(state.posted.drain(..));
            batch
        };

        let count = batch.len();
        for callback in batch {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                self.shared.callbacks_panicked.fetch_add(1, Ordering::Relaxed);
                let msg = panic_message(payload.as_ref());
                tracing::error!("dispatcher callback panicked: {msg}");
            }
        }
        self.shared
            .callbacks_run
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Park until posted work, a due timer or a wake signal arrives.
    ///
    /// Consumes the wake signal.
    pub fn wait_for_work(&self) {
        let mut state = lock(&self.shared.state);
        loop {
            if state.signaled {
                state.signaled = false;
                return;
            }
            let now = Instant::now();
            if state.has_ready(now) {
                return;
            }
            state = match state.next_due() {
                Some(due) => wait_timeout(&self.shared.cvar, state, due - now).0,
                None => wait(&self.shared.cvar, state),
            };
        }
    }

    /// Whether a callback or timer is ready to run right now.
    #[must_use]
    pub fn has_ready_work(&self) -> bool {
        lock(&self.shared.state).has_ready(Instant::now())
    }

    /// Total callbacks run since creation.
    #[must_use]
    pub fn callbacks_run(&self) -> u64 {
        self.shared.callbacks_run.load(Ordering::Relaxed)
    }

    /// Callbacks that panicked since creation.
    #[must_use]
    pub fn callbacks_panicked(&self) -> u64 {
        self.shared.callbacks_panicked.load(Ordering::Relaxed)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("callbacks_run", &self.callbacks_run())
            .finish_non_exhaustive()
    }
}

/// Restores the previously current dispatcher on drop.
#[must_use = "the dispatcher is only current while the guard lives"]
pub struct InstallGuard {
    previous: Option<DispatcherHandle>,
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}
