#![forbid(unsafe_code)]

//! Dispatch session: one worker thread executing submitted actions in order.
//!
//! # Example
//!
//! ```ignore
//! use ftui_headless::{CancellationToken, Session};
//!
//! let session = Session::start_default()?;
//! let none = CancellationToken::none();
//!
//! assert_eq!(session.invoke(|| 2 + 2, &none)?, 4);
//!
//! let pending = session.dispatch_async(|| async {
//!     ftui_headless::pump::yield_now().await;
//!     "done"
//! }, &none)?;
//! assert_eq!(pending.wait()?, "done");
//!
//! session.dispose();
//! ```
//!
//! # Design Invariants
//!
//! 1. **Sequential execution**: all actions run on the worker thread, one
//!    at a time, in enqueue order (inline servicing keeps queue order too).
//! 2. **One outcome**: every accepted dispatch resolves exactly once, to a
//!    value, a fault, or cancellation, including when the session is
//!    disposed with items still queued.
//! 3. **Contained faults**: a panicking action only affects its own handle.
//! 4. **Dispose joins**: after `dispose` returns (off the worker thread) the
//!    worker has exited and `dispatch*` fails with `SessionDisposed`.

use crate::cancel::{CancellationSource, CancellationToken};
use crate::config::{DisposeMode, SessionConfig};
use crate::context::ExecutionContext;
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::error::{DispatchError, DispatchResult, StartError, panic_message};
use crate::pending::{PendingDispatch, completion_with_id, next_id};
use crate::queue::DispatchQueue;
use crate::scope::{AppBuilder, ApplicationScope, BoxError, HeadlessApp};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::sync::lock;
use crate::worker::{WorkItem, Worker};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info, warn};

/// Owner of a dispatch worker thread.
///
/// Dropping the session disposes it.
pub struct Session {
    queue: DispatchQueue<WorkItem>,
    root: CancellationSource,
    dispatcher: DispatcherHandle,
    stats: Arc<SessionStats>,
    callbacks: Dispatcher,
    config: SessionConfig,
    disposed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
}

impl Session {
    /// Start a session whose items run with no application services.
    pub fn start_default() -> Result<Self, StartError> {
        Self::start(SessionConfig::default(), || Ok(HeadlessApp))
    }

    /// Start a session.
    ///
    /// `bootstrap` runs once on the new worker thread and produces the
    /// [`AppBuilder`] used to enter the application scope for every item.
    /// If it fails (or panics) the worker exits and the error is returned
    /// here.
    pub fn start<B, F>(config: SessionConfig, bootstrap: F) -> Result<Self, StartError>
    where
        B: AppBuilder,
        F: FnOnce() -> Result<B, BoxError> + Send + 'static,
    {
        let queue = DispatchQueue::new();
        let root = CancellationSource::new();
        let dispatcher = Dispatcher::new();
        let stats = Arc::new(SessionStats::default());
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), StartError>>(1);

        let worker_queue = queue.clone();
        let worker_root = root.token();
        let worker_dispatcher = dispatcher.clone();
        let worker_stats = Arc::clone(&stats);
        let inline = config.inline_queue_servicing;

        let mut builder = thread::Builder::new().name(config.thread_name.clone());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder.spawn(move || {
            let app = match panic::catch_unwind(AssertUnwindSafe(bootstrap)) {
                Ok(Ok(app)) => app,
                Ok(Err(err)) => {
                    let _ = ready_tx.send(Err(StartError::Bootstrap(err.to_string())));
                    return;
                }
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    let _ = ready_tx.send(Err(StartError::Bootstrap(msg)));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            drop(ready_tx);
            Worker::new(
                worker_queue,
                worker_root,
                worker_dispatcher,
                ApplicationScope::new(app),
                worker_stats,
                inline,
            )
            .run();
        })?;

        let ready = ready_rx.recv().unwrap_or(Err(StartError::WorkerExited));
        if let Err(err) = ready {
            let _ = handle.join();
            return Err(err);
        }

        let worker_thread = handle.thread().id();
        info!(thread = %config.thread_name, "dispatch session started");
        Ok(Self {
            queue,
            root,
            dispatcher: dispatcher.handle(),
            stats,
            callbacks: dispatcher,
            config,
            disposed: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
            worker_thread,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch entry points
    // ─────────────────────────────────────────────────────────────────────

    /// Queue a unit-returning closure.
    pub fn dispatch_action<F>(
        &self,
        action: F,
        cancel: &CancellationToken,
    ) -> DispatchResult<PendingDispatch<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch(action, cancel)
    }

    /// Queue a synchronous closure. It completes on its first run and never
    /// enters a nested pump.
    pub fn dispatch<T, F>(
        &self,
        action: F,
        cancel: &CancellationToken,
    ) -> DispatchResult<PendingDispatch<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.dispatch_core(
            move || std::future::ready(action()),
            self.is_worker_thread(),
            cancel,
        )
    }

    /// Queue a closure returning a future.
    ///
    /// The future is created and polled on the worker thread, so it does
    /// not need to be `Send`. If it is not ready after its first poll the
    /// worker runs a nested pump until it completes or is cancelled.
    pub fn dispatch_async<T, F, Fut>(
        &self,
        action: F,
        cancel: &CancellationToken,
    ) -> DispatchResult<PendingDispatch<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.dispatch_core(action, self.is_worker_thread(), cancel)
    }

    /// Dispatch a synchronous closure and block until it has run.
    pub fn invoke<T, F>(&self, action: F, cancel: &CancellationToken) -> DispatchResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.dispatch(action, cancel)?.wait()
    }

    /// Dispatch an asynchronous closure and block until its future resolves.
    pub fn invoke_async<T, F, Fut>(&self, action: F, cancel: &CancellationToken) -> DispatchResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.dispatch_async(action, cancel)?.wait()
    }

    /// Shared primitive behind every dispatch entry point.
    ///
    /// `capture_context` snapshots the caller's ambient context so the
    /// worker restores it around the action; the public entry points set
    /// it only for re-entrant dispatch from the worker thread.
    pub(crate) fn dispatch_core<T, F, Fut>(
        &self,
        action: F,
        capture_context: bool,
        cancel: &CancellationToken,
    ) -> DispatchResult<PendingDispatch<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        if self.is_disposed() {
            return Err(DispatchError::SessionDisposed);
        }

        let id = next_id();
        let (completer, pending) = completion_with_id(id);
        let context = capture_context.then(ExecutionContext::capture);
        let item = WorkItem::new(id, context, action, completer, cancel.clone());

        if let Err((err, item)) = self.queue.push(item) {
            debug!(item_id = id, "dispatch rejected: queue closed");
            drop(item);
            return Err(err);
        }
        if self.config.inline_queue_servicing {
            self.dispatcher.wake();
        }
        debug!(item_id = id, captured = capture_context, "work item queued");
        Ok(pending)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Stop the session and wait for the worker to exit. Idempotent.
    ///
    /// With [`DisposeMode::CancelPending`] the item in flight is cancelled
    /// and queued items complete as cancelled. With [`DisposeMode::Drain`]
    /// queued items run first.
    ///
    /// Called from inside a dispatched action the session is stopped but
    /// not joined (the worker cannot join itself); the worker exits once
    /// the current item returns.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            info!(mode = ?self.config.dispose_mode, "disposing dispatch session");
        }
        if self.config.dispose_mode == DisposeMode::CancelPending {
            self.root.cancel();
        }
        self.queue.close_for_adding();

        if self.is_worker_thread() {
            warn!("dispose called on the dispatch worker; not waiting for it to exit");
            return;
        }

        {
            let mut worker = lock(&self.worker);
            if let Some(handle) = worker.take()
                && let Err(payload) = handle.join()
            {
                let msg = panic_message(payload.as_ref());
                tracing::error!("dispatch worker panicked: {msg}");
            }
        }
        self.root.cancel();

        // Items that raced with close_for_adding after the worker drained.
        for item in self.queue.drain() {
            item.abandon(DispatchError::Canceled);
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the calling thread is this session's worker.
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_thread
    }

    /// The session-wide cancellation token (fires on dispose).
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.root.token()
    }

    /// Handle to the worker's dispatcher, for posting callbacks from outside.
    #[must_use]
    pub fn dispatcher(&self) -> DispatcherHandle {
        self.dispatcher.clone()
    }

    /// Items waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Worker counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.callbacks.callbacks_run())
    }

    /// The configuration the session was started with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("thread", &self.config.thread_name)
            .field("disposed", &self.is_disposed())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::yield_now;
    use std::time::Duration;

    fn none() -> CancellationToken {
        CancellationToken::none()
    }

    #[test]
    fn sync_dispatch_resolves() {
        let session = Session::start_default().unwrap();
        assert_eq!(session.invoke(|| 2 + 2, &none()).unwrap(), 4);
        assert_eq!(session.stats().frames_pushed, 0);
    }

    #[test]
    fn actions_run_on_worker_thread() {
        let session = Session::start(
            SessionConfig::default().with_thread_name("session-unit"),
            || Ok(HeadlessApp),
        )
        .unwrap();
        let name = session
            .invoke(|| thread::current().name().map(str::to_owned), &none())
            .unwrap();
        assert_eq!(name.as_deref(), Some("session-unit"));
        assert!(!session.is_worker_thread());
    }

    #[test]
    fn async_dispatch_pumps_once() {
        let session = Session::start_default().unwrap();
        let value = session
            .invoke_async(
                || async {
                    yield_now().await;
                    yield_now().await;
                    "done"
                },
                &none(),
            )
            .unwrap();
        assert_eq!(value, "done");
        let stats = session.stats();
        assert_eq!(stats.frames_pushed, 1);
        assert_eq!(stats.frames_completed, 1);
    }

    #[test]
    fn bootstrap_error_is_reported() {
        let err = Session::start(SessionConfig::default(), || -> Result<HeadlessApp, BoxError> {
            Err("missing entry point".into())
        })
        .unwrap_err();
        assert!(matches!(err, StartError::Bootstrap(ref m) if m == "missing entry point"));
    }

    #[test]
    fn bootstrap_panic_is_reported() {
        let err = Session::start(SessionConfig::default(), || -> Result<HeadlessApp, BoxError> {
            panic!("bad app type")
        })
        .unwrap_err();
        assert!(matches!(err, StartError::Bootstrap(ref m) if m == "bad app type"));
    }

    #[test]
    fn dispatch_after_dispose_fails() {
        let session = Session::start_default().unwrap();
        session.dispose();
        session.dispose();
        assert!(session.is_disposed());
        assert!(matches!(
            session.dispatch(|| 1, &none()),
            Err(DispatchError::SessionDisposed)
        ));
    }

    #[test]
    fn session_token_fires_on_dispose() {
        let session = Session::start_default().unwrap();
        let token = session.token();
        assert!(!token.is_canceled());
        session.dispose();
        assert!(token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn debug_lists_state() {
        let session = Session::start_default().unwrap();
        let text = format!("{session:?}");
        assert!(text.contains("ftui-headless"));
        assert!(text.contains("disposed: false"));
    }
}
