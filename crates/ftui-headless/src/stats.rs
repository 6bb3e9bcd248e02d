#![forbid(unsafe_code)]

//! Worker counters.
//!
//! Written only by the worker thread, read from anywhere. The counters make
//! the pump observable from tests: a synchronous dispatch leaves
//! `frames_pushed` untouched, an asynchronous one bumps it exactly once.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub(crate) struct SessionStats {
    items_executed: AtomicU64,
    items_canceled: AtomicU64,
    items_faulted: AtomicU64,
    scope_failures: AtomicU64,
    frames_pushed: AtomicU64,
    frames_completed: AtomicU64,
    frame_depth: AtomicUsize,
    max_frame_depth: AtomicUsize,
}

impl SessionStats {
    pub(crate) fn item_executed(&self) {
        self.items_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn item_canceled(&self) {
        self.items_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn item_faulted(&self) {
        self.items_faulted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn scope_failed(&self) {
        self.scope_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame push and return the new nesting depth.
    pub(crate) fn frame_pushed(&self) -> usize {
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
        let depth = self.frame_depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_frame_depth.fetch_max(depth, Ordering::Relaxed);
        depth
    }

    pub(crate) fn frame_completed(&self) {
        self.frames_completed.fetch_add(1, Ordering::Relaxed);
        self.frame_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, callbacks_run: u64) -> StatsSnapshot {
        StatsSnapshot {
            items_executed: self.items_executed.load(Ordering::Relaxed),
            items_canceled: self.items_canceled.load(Ordering::Relaxed),
            items_faulted: self.items_faulted.load(Ordering::Relaxed),
            scope_failures: self.scope_failures.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frame_depth: self.frame_depth.load(Ordering::Relaxed),
            max_frame_depth: self.max_frame_depth.load(Ordering::Relaxed),
            callbacks_run,
        }
    }
}

/// Point-in-time copy of a session's worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatsSnapshot {
    /// Work items whose action ran (successfully or not).
    pub items_executed: u64,
    /// Items that finished as cancelled, including an abandoned tail.
    pub items_canceled: u64,
    /// Items whose action panicked.
    pub items_faulted: u64,
    /// Items resolved as a scope failure, whether the application scope
    /// refused to enter (the action never ran) or failed to release.
    pub scope_failures: u64,
    /// Nested pump frames entered.
    pub frames_pushed: u64,
    /// Nested pump frames exited.
    pub frames_completed: u64,
    /// Frames active right now.
    pub frame_depth: usize,
    /// Deepest frame nesting observed.
    pub max_frame_depth: usize,
    /// Dispatcher callbacks run by the worker.
    pub callbacks_run: u64,
}
