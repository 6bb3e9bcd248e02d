#![forbid(unsafe_code)]

//! Ambient execution context with explicit capture and restore.
//!
//! Each thread has an ambient key/value context (for instance the active
//! locale, a test name, or a tenant id). A dispatch issued from the worker
//! thread captures the current context as an [`ExecutionContext`] snapshot
//! that travels with the work item; the worker restores it around the
//! action with a scoped [`ContextGuard`].
//!
//! Snapshots are immutable. Setting a value replaces the thread's map with a
//! copy, so a captured snapshot never observes later writes.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Value = Arc<dyn Any + Send + Sync>;

thread_local! {
    static AMBIENT: RefCell<ExecutionContext> = RefCell::new(ExecutionContext::empty());
}

/// Immutable snapshot of a thread's ambient context.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    values: Arc<HashMap<&'static str, Value>>,
}

impl ExecutionContext {
    /// A context with no values.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot the calling thread's ambient context.
    #[must_use]
    pub fn capture() -> Self {
        AMBIENT.with(|ambient| ambient.borrow().clone())
    }

    /// Look up a value in this snapshot.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .get(key)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    /// Number of keys in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Make this snapshot the thread's ambient context until the guard drops.
    #[must_use = "dropping the guard immediately restores the previous context"]
    pub fn enter(&self) -> ContextGuard {
        let previous = replace(self.clone());
        ContextGuard {
            previous: Some(previous),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort_unstable();
        f.debug_struct("ExecutionContext")
            .field("keys", &keys)
            .finish()
    }
}

/// RAII guard restoring the previous ambient context on drop.
#[must_use = "dropping the guard immediately restores the previous context"]
pub struct ContextGuard {
    previous: Option<ExecutionContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            replace(previous);
        }
    }
}

fn replace(context: ExecutionContext) -> ExecutionContext {
    AMBIENT.with(|ambient| std::mem::replace(&mut *ambient.borrow_mut(), context))
}

/// Set an ambient value on the calling thread.
pub fn set_value<T: Any + Send + Sync>(key: &'static str, value: T) {
    AMBIENT.with(|ambient| {
        let mut ambient = ambient.borrow_mut();
        let mut values = (*ambient.values).clone();
        values.insert(key, Arc::new(value));
        ambient.values = Arc::new(values);
    });
}

/// Remove an ambient value from the calling thread. Returns whether it existed.
pub fn remove_value(key: &str) -> bool {
    AMBIENT.with(|ambient| {
        let mut ambient = ambient.borrow_mut();
        if !ambient.values.contains_key(key) {
            return false;
        }
        let mut values = (*ambient.values).clone();
        values.remove(key);
        ambient.values = Arc::new(values);
        true
    })
}

/// Read an ambient value on the calling thread.
#[must_use]
pub fn value<T: Any + Send + Sync>(key: &str) -> Option<Arc<T>> {
    AMBIENT.with(|ambient| ambient.borrow().get(key))
}

/// Clear the calling thread's ambient context, returning what was there.
pub(crate) fn reset() -> ExecutionContext {
    replace(ExecutionContext::empty())
}

/// Restore a context previously returned by [`reset`].
pub(crate) fn restore(context: ExecutionContext) {
    replace(context);
}
