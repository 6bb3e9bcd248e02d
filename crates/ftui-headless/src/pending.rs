#![forbid(unsafe_code)]

//! Single-assignment result handles.
//!
//! A [`PendingDispatch`] is the reader half: callers block on it with
//! [`wait`](PendingDispatch::wait) or `.await` it. The [`Completer`] is the
//! single writer, owned by the work item on the worker thread. Exactly one
//! outcome is ever recorded: `complete` consumes the completer, and a
//! completer dropped without completing records [`DispatchError::Canceled`]
//! so a waiter can never hang on an abandoned item.
//!
//! [`completion`] hands out a free-standing pair, which is also the way to
//! build a manually completed future in tests.

use crate::error::{DispatchError, DispatchResult};
use crate::sync::{lock, wait, wait_timeout};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique dispatch id.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    cvar: Condvar,
}

struct SlotState<T> {
    outcome: Option<DispatchResult<T>>,
    completed: bool,
    waker: Option<Waker>,
}

/// Create a connected completer / pending pair.
#[must_use]
pub fn completion<T>() -> (Completer<T>, PendingDispatch<T>) {
    completion_with_id(next_id())
}

pub(crate) fn completion_with_id<T>(id: u64) -> (Completer<T>, PendingDispatch<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState {
            outcome: None,
            completed: false,
            waker: None,
        }),
        cvar: Condvar::new(),
    });
    (
        Completer {
            slot: Some(Arc::clone(&slot)),
            id,
        },
        PendingDispatch { slot, id },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer
// ─────────────────────────────────────────────────────────────────────────────

/// The writing half of a pending dispatch.
pub struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
    id: u64,
}

impl<T> Completer<T> {
    /// Id shared with the matching [`PendingDispatch`].
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record the outcome and wake any waiter.
    pub fn complete(mut self, outcome: DispatchResult<T>) {
        self.set(outcome);
    }

    /// Record a successful value.
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Record an error outcome.
    pub fn fail(self, error: DispatchError) {
        self.complete(Err(error));
    }

    /// Whether every [`PendingDispatch`] for this completer has been dropped.
    #[must_use]
    pub fn is_orphaned(&self) -> bool {
        self.slot
            .as_ref()
            .is_none_or(|slot| Arc::strong_count(slot) == 1)
    }

    fn set(&mut self, outcome: DispatchResult<T>) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let waker = {
            let mut state = lock(&slot.state);
            debug_assert!(!state.completed, "pending dispatch completed twice");
            state.outcome = Some(outcome);
            state.completed = true;
            state.waker.take()
        };
        slot.cvar.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.set(Err(DispatchError::Canceled));
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").field("id", &self.id).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

/// Future-like handle for the eventual outcome of one dispatched action.
///
/// Resolves to exactly one of a value, a [`DispatchError::Faulted`] carrying
/// the action's panic, or [`DispatchError::Canceled`].
#[must_use = "the outcome of a dispatch is only observable through its handle"]
pub struct PendingDispatch<T> {
    slot: Arc<Slot<T>>,
    id: u64,
}

impl<T> PendingDispatch<T> {
    /// Dispatch id, also used in worker logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether an outcome has been recorded.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        lock(&self.slot.state).completed
    }

    /// Block the calling thread until the outcome is available.
    pub fn wait(self) -> DispatchResult<T> {
        let mut state = lock(&self.slot.state);
        while !state.completed {
            state = wait(&self.slot.cvar, state);
        }
        take_outcome(&mut state)
    }

    /// Block for at most `timeout`. On timeout the handle is returned so the
    /// caller can keep waiting.
    ///
    /// A timeout too large to express as a deadline waits without bound.
    pub fn wait_timeout(self, timeout: Duration) -> Result<DispatchResult<T>, Self> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Ok(self.wait());
        };
        {
            let mut state = lock(&self.slot.state);
            loop {
                if state.completed {
                    return Ok(take_outcome(&mut state));
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = wait_timeout(&self.slot.cvar, state, deadline - now);
                state = guard;
            }
        }
        Err(self)
    }
}

fn take_outcome<T>(state: &mut SlotState<T>) -> DispatchResult<T> {
    state.outcome.take().unwrap_or(Err(DispatchError::Canceled))
}

impl<T> Future for PendingDispatch<T> {
    type Output = DispatchResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.slot.state);
        if state.completed {
            return Poll::Ready(take_outcome(&mut state));
        }
        match &state.waker {
            Some(existing) if existing.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for PendingDispatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDispatch")
            .field("id", &self.id)
            .field("completed", &self.is_completed())
            .finish()
    }
}
