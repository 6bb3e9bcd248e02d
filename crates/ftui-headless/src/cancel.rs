#![forbid(unsafe_code)]

//! Cooperative cancellation shared between caller threads and the worker.
//!
//! A [`CancellationSource`] owns the right to cancel; any number of cloned
//! [`CancellationToken`]s observe it. Tokens accept callbacks that run
//! exactly once when cancellation fires, which is how the worker wakes a
//! blocked queue take or stops a nested pump from another thread.
//!
//! Linked sources ([`CancellationSource::linked`]) fire when any parent
//! fires. Every dispatched item runs under a source linked to the session's
//! root token and the caller's token.

use crate::sync::{lock, wait, wait_timeout};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct CancelInner {
    state: Mutex<CancelState>,
    cvar: Condvar,
}

struct CancelState {
    canceled: bool,
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

impl CancelInner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CancelState {
                canceled: false,
                next_id: 0,
                callbacks: Vec::new(),
            }),
            cvar: Condvar::new(),
        })
    }

    fn is_canceled(&self) -> bool {
        lock(&self.state).canceled
    }

    fn cancel(&self) -> bool {
        let callbacks = {
            let mut state = lock(&self.state);
            if state.canceled {
                return false;
            }
            state.canceled = true;
            std::mem::take(&mut state.callbacks)
        };
        self.cvar.notify_all();
        // Callbacks run outside the lock: they may take other locks or
        // cancel further sources.
        for (_, callback) in callbacks {
            callback();
        }
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source
// ─────────────────────────────────────────────────────────────────────────────

/// The cancelling side of a cancellation pair.
pub struct CancellationSource {
    inner: Arc<CancelInner>,
    links: Vec<CancellationRegistration>,
}

impl CancellationSource {
    /// Create a fresh, uncancelled source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: CancelInner::new(),
            links: Vec::new(),
        }
    }

    /// Create a source that is cancelled as soon as any of `parents` is.
    ///
    /// If a parent is already cancelled the new source starts cancelled.
    /// The links are released when the source is dropped.
    #[must_use]
    pub fn linked(parents: &[&CancellationToken]) -> Self {
        let inner = CancelInner::new();
        let links = parents
            .iter()
            .map(|parent| {
                let child: Weak<CancelInner> = Arc::downgrade(&inner);
                parent.register(move || {
                    if let Some(child) = child.upgrade() {
                        child.cancel();
                    }
                })
            })
            .collect();
        Self { inner, links }
    }

    /// A token observing this source.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Request cancellation. Returns `true` on the call that actually
    /// transitioned the source; later calls are no-ops.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    /// Number of parent links held by this source.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("canceled", &self.is_canceled())
            .field("links", &self.links.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token
// ─────────────────────────────────────────────────────────────────────────────

/// The observing side of a cancellation pair. Cheap to clone.
///
/// [`CancellationToken::none`] never fires.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Option<Arc<CancelInner>>,
}

impl CancellationToken {
    /// A token that can never be cancelled.
    #[must_use]
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// Whether this token is attached to a source at all.
    #[must_use]
    pub fn can_be_canceled(&self) -> bool {
        self.inner.is_some()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.as_ref().is_some_and(|inner| inner.is_canceled())
    }

    /// Register a callback to run once when the token fires.
    ///
    /// If the token has already fired the callback runs immediately on the
    /// calling thread. Dropping the returned registration unregisters the
    /// callback if it has not run yet.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> CancellationRegistration {
        let Some(inner) = &self.inner else {
            return CancellationRegistration::empty();
        };
        let mut state = lock(&inner.state);
        if state.canceled {
            drop(state);
            callback();
            return CancellationRegistration::empty();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, Box::new(callback)));
        CancellationRegistration {
            inner: Arc::downgrade(inner),
            id,
        }
    }

    /// Block until the token fires or `timeout` elapses.
    ///
    /// Returns `true` if cancelled, `false` on timeout. A
    /// [`none`](Self::none) token simply sleeps out the timeout. A timeout
    /// too large to express as a deadline waits without bound.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(inner) = &self.inner else {
            std::thread::sleep(timeout);
            return false;
        };
        let deadline = Instant::now().checked_add(timeout);
        let mut state = lock(&inner.state);
        loop {
            if state.canceled {
                return true;
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    wait_timeout(&inner.cvar, state, deadline - now).0
                }
                None => wait(&inner.cvar, state),
            };
        }
    }

    #[cfg(test)]
    fn callback_count(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| lock(&inner.state).callbacks.len())
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("can_be_canceled", &self.can_be_canceled())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────────────────

/// Handle for a registered cancellation callback. Unregisters on drop.
#[must_use = "dropping the registration removes the callback"]
pub struct CancellationRegistration {
    inner: Weak<CancelInner>,
    id: u64,
}

impl CancellationRegistration {
    fn empty() -> Self {
        Self {
            inner: Weak::new(),
            id: 0,
        }
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let removed = {
                let mut state = lock(&inner.state);
                state
                    .callbacks
                    .iter()
                    .position(|(id, _)| *id == self.id)
                    .map(|idx| state.callbacks.swap_remove(idx))
            };
            // Drop the callback (and whatever it captured) outside the lock.
            drop(removed);
        }
    }
}
