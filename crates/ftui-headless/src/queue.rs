#![forbid(unsafe_code)]

//! Blocking FIFO queue with close-for-adding semantics.
//!
//! Many producers, one consumer. [`DispatchQueue::take_blocking`] parks the
//! consumer until an item arrives, the queue is closed and drained, or the
//! supplied cancellation token fires.
//!
//! # Invariants
//!
//! 1. Items are taken in push order.
//! 2. After [`close_for_adding`](DispatchQueue::close_for_adding), `push`
//!    fails with [`DispatchError::QueueClosed`] but queued items remain
//!    takeable.
//! 3. No lost wakeups: the consumer checks for items, cancellation and
//!    closure under the queue lock, and every producer or canceller notifies
//!    while holding (or after acquiring) that same lock.

use crate::cancel::CancellationToken;
use crate::error::DispatchError;
use crate::sync::{lock, wait};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Result of a blocking take.
#[derive(Debug)]
pub enum Take<T> {
    /// The next item in FIFO order.
    Item(T),
    /// The token fired before an item became available.
    Canceled,
    /// The queue is closed for adding and empty.
    Closed,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe blocking FIFO. Clones share the same queue.
pub struct DispatchQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for DispatchQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DispatchQueue<T> {
    /// Create an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Enqueue an item and wake the consumer.
    ///
    /// On failure the item is handed back alongside the error so the caller
    /// can complete it.
    pub fn push(&self, item: T) -> Result<(), (DispatchError, T)> {
        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err((DispatchError::QueueClosed, item));
            }
            state.items.push_back(item);
        }
        self.inner.ready.notify_one();
        Ok(())
    }

    /// Take the next item without blocking.
    pub fn try_take(&self) -> Option<T> {
        lock(&self.inner.state).items.pop_front()
    }

    /// Stop accepting new items. Idempotent. Wakes a blocked consumer so it
    /// can observe closure once the queue is drained.
    pub fn close_for_adding(&self) {
        lock(&self.inner.state).closed = true;
        self.inner.ready.notify_all();
    }

    /// Whether `push` is still accepted.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner.state).items.len()
    }

    /// Whether no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every queued item in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        lock(&self.inner.state).items.drain(..).collect()
    }
}

impl<T: Send + 'static> DispatchQueue<T> {
    /// Block until an item is available, the queue is closed and empty, or
    /// `cancel` fires.
    ///
    /// Cancellation wins over queued items: a fired token returns
    /// [`Take::Canceled`] even if the queue is not empty.
    pub fn take_blocking(&self, cancel: &CancellationToken) -> Take<T> {
        let inner = Arc::clone(&self.inner);
        let _wake_on_cancel = cancel.register(move || {
            // Taking the lock orders this notify after the consumer's check.
            drop(lock(&inner.state));
            inner.ready.notify_all();
        });

        let mut state = lock(&self.inner.state);
        loop {
            if cancel.is_canceled() {
                return Take::Canceled;
            }
            if let Some(item) = state.items.pop_front() {
                return Take::Item(item);
            }
            if state.closed {
                return Take::Closed;
            }
            state = wait(&self.inner.ready, state);
        }
    }
}
