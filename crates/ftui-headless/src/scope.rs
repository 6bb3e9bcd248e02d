#![forbid(unsafe_code)]

//! Application scope: "the application is active on this thread".
//!
//! The scope is entered before every dispatched item and exited after it on
//! every path. What "active application" means belongs to the embedding
//! framework and is supplied through [`AppBuilder`]; this module only
//! guarantees pairing and cleanup.
//!
//! # Invariants
//!
//! 1. Every successful [`ApplicationScope::enter`] is matched by exactly one
//!    release, either [`ApplicationScope::exit`] or the handle's `Drop`.
//! 2. A failed setup releases whatever enter already acquired before the
//!    error is returned.
//! 3. Entering the outermost scope and leaving it both reset the dispatcher
//!    and the ambient context, so nothing leaks from one item to the next.
//!    Nested scopes (items run inline by a pump) leave the outer item's
//!    dispatcher state alone.

use crate::context::{self, ExecutionContext};
use crate::dispatcher::Dispatcher;
use crate::error::{ScopeError, panic_message};
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Boxed error returned by application hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether an application scope is active on the calling thread.
#[must_use]
pub fn is_active() -> bool {
    depth() > 0
}

/// Number of nested application scopes active on the calling thread.
#[must_use]
pub fn depth() -> usize {
    DEPTH.with(Cell::get)
}

/// Embedding framework hook that installs and removes the active application.
///
/// Produced once per session by the bootstrap factory and then used on the
/// worker thread only.
pub trait AppBuilder: Send + 'static {
    /// Install application services for the current thread.
    fn setup(&mut self) -> Result<(), BoxError>;

    /// Remove whatever `setup` installed.
    fn teardown(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Builder for sessions that need no application services.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessApp;

impl AppBuilder for HeadlessApp {
    fn setup(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Proof that a scope was entered. Consumed by [`ApplicationScope::exit`].
#[must_use = "a scope handle must be passed to ApplicationScope::exit"]
pub struct ScopeHandle {
    depth: usize,
    previous: Option<ExecutionContext>,
}

impl ScopeHandle {
    /// Nesting depth of this scope (1 for the outermost).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn release(&mut self) {
        if let Some(previous) = self.previous.take() {
            context::restore(previous);
            DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        }
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        if self.previous.is_some() {
            tracing::warn!(depth = self.depth, "application scope dropped without exit");
            self.release();
        }
    }
}

impl fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("depth", &self.depth)
            .field("released", &self.previous.is_none())
            .finish()
    }
}

/// Scope resource owning the session's [`AppBuilder`].
pub struct ApplicationScope {
    builder: Box<dyn AppBuilder>,
}

impl ApplicationScope {
    /// Wrap a builder.
    pub fn new(builder: impl AppBuilder) -> Self {
        Self {
            builder: Box::new(builder),
        }
    }

    /// Enter the scope on the calling thread.
    pub fn enter(&mut self, dispatcher: &Dispatcher) -> Result<ScopeHandle, ScopeError> {
        let depth = DEPTH.with(|d| {
            let next = d.get() + 1;
            d.set(next);
            next
        });
        let mut handle = ScopeHandle {
            depth,
            previous: Some(context::reset()),
        };
        if depth == 1 {
            dispatcher.reset();
        }

        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.builder.setup())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ScopeError::Setup(err.to_string())),
            Err(payload) => Err(ScopeError::Panicked(panic_message(payload.as_ref()))),
        };

        match result {
            Ok(()) => {
                tracing::trace!(depth, "application scope entered");
                Ok(handle)
            }
            Err(err) => {
                tracing::debug!(depth, error = %err, "application scope setup failed");
                if depth == 1 {
                    dispatcher.reset();
                }
                handle.release();
                Err(err)
            }
        }
    }

    /// Tear the application down and release the scope.
    ///
    /// Release happens even when teardown fails; the teardown error is
    /// returned afterwards.
    pub fn exit(&mut self, mut handle: ScopeHandle, dispatcher: &Dispatcher) -> Result<(), ScopeError> {
        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.builder.teardown())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ScopeError::Teardown(err.to_string())),
            Err(payload) => Err(ScopeError::Panicked(panic_message(payload.as_ref()))),
        };
        if handle.depth == 1 {
            dispatcher.reset();
        }
        handle.release();
        tracing::trace!(depth = handle.depth, ok = result.is_ok(), "application scope exited");
        result
    }
}

impl fmt::Debug for ApplicationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationScope").finish_non_exhaustive()
    }
}
