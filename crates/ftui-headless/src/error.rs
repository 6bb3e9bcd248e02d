#![forbid(unsafe_code)]

//! Error types for dispatch sessions.
//!
//! # Failure Modes
//!
//! | Error | Raised by | Meaning |
//! |-------|-----------|---------|
//! | [`DispatchError::QueueClosed`] | queue push | Adding was disallowed (dispose in progress) |
//! | [`DispatchError::SessionDisposed`] | `Session::dispatch*` | Session already disposed |
//! | [`DispatchError::Canceled`] | pending outcome | Per-call or session token fired first |
//! | [`DispatchError::Faulted`] | pending outcome | The action panicked |
//! | [`DispatchError::ScopeFailed`] | pending outcome | Application scope could not be entered or exited |
//! | [`StartError`] | `Session::start` | Worker thread or bootstrap failed |

use std::any::Any;
use std::fmt;
use std::io;
use std::panic;

// ─────────────────────────────────────────────────────────────────────────────
// Fault
// ─────────────────────────────────────────────────────────────────────────────

/// A panic captured on the worker thread while running a dispatched action.
///
/// The original payload is kept so the caller can re-raise it with
/// [`Fault::resume`] and observe exactly what the action raised.
pub struct Fault {
    message: String,
    payload: Box<dyn Any + Send + 'static>,
}

impl Fault {
    /// Wrap a payload returned by [`std::panic::catch_unwind`].
    pub fn from_panic(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self {
            message: panic_message(payload.as_ref()),
            payload,
        }
    }

    /// Human-readable panic message (`"unknown panic payload"` for
    /// non-string payloads).
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Borrow the raw panic payload.
    #[must_use]
    pub fn payload(&self) -> &(dyn Any + Send + 'static) {
        self.payload.as_ref()
    }

    /// Re-raise the captured panic on the current thread.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Render a panic payload the same way the runtime reports panicked tasks.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scope errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failure while entering or exiting the application scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// The application builder refused to set up.
    Setup(String),
    /// Teardown reported an error.
    Teardown(String),
    /// Setup or teardown panicked.
    Panicked(String),
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(msg) => write!(f, "application setup failed: {msg}"),
            Self::Teardown(msg) => write!(f, "application teardown failed: {msg}"),
            Self::Panicked(msg) => write!(f, "application scope panicked: {msg}"),
        }
    }
}

impl std::error::Error for ScopeError {}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors observed when dispatching or when awaiting a pending dispatch.
#[derive(Debug)]
pub enum DispatchError {
    /// The dispatch queue no longer accepts items.
    QueueClosed,
    /// The session has been disposed.
    SessionDisposed,
    /// The item was cancelled before it completed.
    Canceled,
    /// The action panicked.
    Faulted(Fault),
    /// The application scope could not be entered or exited cleanly.
    ScopeFailed(ScopeError),
}

impl DispatchError {
    /// Whether this is a cancellation outcome.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Whether the action itself faulted.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }

    /// Take the fault out of a [`DispatchError::Faulted`].
    #[must_use]
    pub fn into_fault(self) -> Option<Fault> {
        match self {
            Self::Faulted(fault) => Some(fault),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueClosed => write!(f, "dispatch queue is closed for adding"),
            Self::SessionDisposed => write!(f, "session was already disposed"),
            Self::Canceled => write!(f, "operation was canceled"),
            Self::Faulted(fault) => write!(f, "dispatched action panicked: {fault}"),
            Self::ScopeFailed(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ScopeFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ScopeError> for DispatchError {
    fn from(err: ScopeError) -> Self {
        Self::ScopeFailed(err)
    }
}

/// Result type for dispatch outcomes.
pub type DispatchResult<T> = Result<T, DispatchError>;

// ─────────────────────────────────────────────────────────────────────────────
// Start errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failure to bring a session up. Surfaced synchronously from `Session::start`.
#[derive(Debug)]
pub enum StartError {
    /// The worker thread could not be spawned.
    Spawn(io::Error),
    /// The bootstrap factory failed on the worker thread.
    Bootstrap(String),
    /// The worker exited before reporting readiness.
    WorkerExited,
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to spawn dispatch worker: {e}"),
            Self::Bootstrap(msg) => write!(f, "application bootstrap failed: {msg}"),
            Self::WorkerExited => write!(f, "dispatch worker exited during startup"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StartError {
    fn from(e: io::Error) -> Self {
        Self::Spawn(e)
    }
}
