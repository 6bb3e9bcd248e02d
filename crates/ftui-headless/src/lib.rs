#![forbid(unsafe_code)]

//! FrankenTUI Headless
//!
//! Single-thread dispatch sessions for driving UI code deterministically
//! from tests. Code that must run on "the UI thread" is submitted to a
//! [`Session`], which executes it on one dedicated worker thread, in order,
//! inside an application scope.
//!
//! # Key Components
//!
//! - [`Session`] - Worker thread owner and dispatch entry points
//! - [`SessionRegistry`] - Lazily started sessions shared per key
//! - [`PendingDispatch`] - Handle to a dispatched action's eventual outcome
//! - [`CancellationSource`] / [`CancellationToken`] - Cooperative cancellation
//! - [`Dispatcher`] - Per-thread callback and timer queue pumped by the worker
//! - [`NestedPump`] / [`Frame`] - Nested message loop for asynchronous actions
//! - [`ApplicationScope`] / [`AppBuilder`] - Per-item application setup and teardown
//! - [`ExecutionContext`] - Ambient values carried into re-entrant dispatch
//!
//! # How it fits in the system
//! A test holds a `Session` (often through a `SessionRegistry` keyed by
//! suite) and calls `invoke` or `dispatch_async` with closures that touch
//! UI state. Synchronous closures finish in one step. Asynchronous ones
//! drive a nested pump on the worker until their future resolves, so
//! callbacks posted by the code under test still run while the test
//! awaits them.

pub mod cancel;
pub mod config;
pub mod context;
pub mod debug_trace;
pub mod dispatcher;
pub mod error;
pub mod pending;
pub mod pump;
pub mod queue;
pub mod registry;
pub mod scope;
pub mod session;
pub mod stats;

mod sync;
mod worker;

pub use cancel::{CancellationRegistration, CancellationSource, CancellationToken};
pub use config::{DisposeMode, SessionConfig};
pub use context::{ContextGuard, ExecutionContext};
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use error::{DispatchError, DispatchResult, Fault, ScopeError, StartError};
pub use pending::{Completer, PendingDispatch, completion};
pub use pump::{Frame, FrameStopper, NestedPump, PumpHooks};
pub use queue::{DispatchQueue, Take};
pub use registry::SessionRegistry;
pub use scope::{AppBuilder, ApplicationScope, BoxError, HeadlessApp, ScopeHandle};
pub use session::Session;
pub use stats::StatsSnapshot;
