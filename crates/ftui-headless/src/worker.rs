#![forbid(unsafe_code)]

//! Worker thread loop and work items.
//!
//! The worker owns the application scope and the dispatcher and runs one
//! item at a time:
//!
//! ```text
//!   Idle ──take──▶ Executing(item) ──▶ ReleasingScope ──▶ Idle
//!     │                 │
//!     │                 └─ pending future ─▶ NestedPump(frame) ─┐
//!     │                                           ▲             │
//!     │                                           └─────────────┘
//!     └─ root cancelled / queue closed ─▶ Stopped (tail cancelled)
//! ```
//!
//! Panics from an action, its future, or the scope hooks are caught and
//! recorded on that item's pending handle; they never end the loop.

use crate::cancel::{CancellationSource, CancellationToken};
use crate::context::ExecutionContext;
use crate::debug_trace::ItemTrace;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, DispatchResult, Fault, ScopeError};
use crate::pending::Completer;
use crate::pump::{Frame, NestedPump, PumpHooks};
use crate::queue::{DispatchQueue, Take};
use crate::scope::ApplicationScope;
use crate::stats::SessionStats;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, debug_span, info, info_span, trace};

/// How an item ended, for logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemOutcome {
    Succeeded,
    Canceled,
    Faulted,
    ScopeFailed,
}

impl ItemOutcome {
    fn of<T>(outcome: &DispatchResult<T>) -> Self {
        match outcome {
            Ok(_) => Self::Succeeded,
            Err(DispatchError::Faulted(_)) => Self::Faulted,
            Err(DispatchError::ScopeFailed(_)) => Self::ScopeFailed,
            Err(_) => Self::Canceled,
        }
    }
}

/// Type-erased body of a work item.
pub(crate) trait Job: Send {
    /// Run the action inside an entered scope, storing its outcome.
    fn execute(&mut self, worker: &mut Worker);

    /// Fold the scope release result into the stored outcome.
    fn settle(&mut self, release: Result<(), ScopeError>) -> ItemOutcome;

    /// Hand the settled outcome to the waiter.
    fn deliver(self: Box<Self>);

    /// Record `error` without running the action.
    fn abandon(self: Box<Self>, error: DispatchError);
}

/// One queued unit of work.
pub(crate) struct WorkItem {
    pub(crate) id: u64,
    context: Option<ExecutionContext>,
    job: Box<dyn Job>,
}

impl WorkItem {
    pub(crate) fn new<T, F, Fut>(
        id: u64,
        context: Option<ExecutionContext>,
        action: F,
        completer: Completer<T>,
        cancel: CancellationToken,
    ) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        Self {
            id,
            context,
            job: Box::new(DispatchJob {
                action: Some(action),
                cancel,
                completer,
                outcome: None,
            }),
        }
    }

    pub(crate) fn abandon(self, error: DispatchError) {
        trace!(item_id = self.id, error = %error, "work item abandoned");
        self.job.abandon(error);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch job
// ─────────────────────────────────────────────────────────────────────────────

struct DispatchJob<T, F> {
    action: Option<F>,
    cancel: CancellationToken,
    completer: Completer<T>,
    outcome: Option<DispatchResult<T>>,
}

impl<T, F, Fut> Job for DispatchJob<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + 'static,
{
    fn execute(&mut self, worker: &mut Worker) {
        let Some(action) = self.action.take() else {
            return;
        };

        let linked = CancellationSource::linked(&[&worker.root, &self.cancel]);
        if linked.is_canceled() {
            self.outcome = Some(Err(DispatchError::Canceled));
            return;
        }

        let future = match panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(future) => future,
            Err(payload) => {
                self.outcome = Some(Err(DispatchError::Faulted(Fault::from_panic(payload))));
                return;
            }
        };
        let mut future = pin!(future);

        let frame = Frame::new(worker.dispatcher.handle());
        let waker = frame.waker();
        if let Poll::Ready(outcome) = poll_guarded(future.as_mut(), &waker) {
            // Synchronous fast path: no pump.
            self.outcome = Some(outcome);
            return;
        }

        let stopper = frame.stopper();
        let _stop_on_cancel = linked.token().register(move || stopper.stop());

        let pump = worker.pump();
        let mut hooks = ActionHooks {
            future: future.as_mut(),
            waker,
            output: None,
            worker,
        };
        pump.run(&frame, &mut hooks);

        // Without an output the frame was stopped by cancellation; the future
        // is dropped here and its eventual result is never observed.
        self.outcome = Some(hooks.output.unwrap_or(Err(DispatchError::Canceled)));
    }

    fn settle(&mut self, release: Result<(), ScopeError>) -> ItemOutcome {
        let outcome = match (self.outcome.take(), release) {
            (Some(outcome), Ok(())) => outcome,
            (Some(Ok(_)), Err(scope)) => Err(DispatchError::ScopeFailed(scope)),
            (Some(Err(err)), Err(scope)) => {
                tracing::error!(error = %scope, "application scope release failed");
                Err(err)
            }
            (None, Ok(())) => Err(DispatchError::Canceled),
            (None, Err(scope)) => Err(DispatchError::ScopeFailed(scope)),
        };
        let kind = ItemOutcome::of(&outcome);
        self.outcome = Some(outcome);
        kind
    }

    fn deliver(self: Box<Self>) {
        let this = *self;
        this.completer
            .complete(this.outcome.unwrap_or(Err(DispatchError::Canceled)));
    }

    fn abandon(self: Box<Self>, error: DispatchError) {
        self.completer.fail(error);
    }
}

fn poll_guarded<Fut: Future>(
    future: Pin<&mut Fut>,
    waker: &Waker,
) -> Poll<DispatchResult<Fut::Output>> {
    let mut cx = Context::from_waker(waker);
    match panic::catch_unwind(AssertUnwindSafe(|| future.poll(&mut cx))) {
        Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
        Ok(Poll::Pending) => Poll::Pending,
        Err(payload) => Poll::Ready(Err(DispatchError::Faulted(Fault::from_panic(payload)))),
    }
}

struct ActionHooks<'a, Fut: Future> {
    future: Pin<&'a mut Fut>,
    waker: Waker,
    output: Option<DispatchResult<Fut::Output>>,
    worker: &'a mut Worker,
}

impl<Fut: Future> PumpHooks for ActionHooks<'_, Fut> {
    fn on_wake(&mut self, frame: &Frame) {
        if self.output.is_some() {
            return;
        }
        if let Poll::Ready(outcome) = poll_guarded(self.future.as_mut(), &self.waker) {
            self.output = Some(outcome);
            frame.stop();
        }
    }

    fn on_idle(&mut self) -> bool {
        self.worker.service_queue_inline()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

/// State owned by the worker thread for the lifetime of a session.
pub(crate) struct Worker {
    queue: DispatchQueue<WorkItem>,
    root: CancellationToken,
    dispatcher: Dispatcher,
    scope: ApplicationScope,
    stats: Arc<SessionStats>,
    inline_queue_servicing: bool,
    depth: usize,
}

impl Worker {
    pub(crate) fn new(
        queue: DispatchQueue<WorkItem>,
        root: CancellationToken,
        dispatcher: Dispatcher,
        scope: ApplicationScope,
        stats: Arc<SessionStats>,
        inline_queue_servicing: bool,
    ) -> Self {
        Self {
            queue,
            root,
            dispatcher,
            scope,
            stats,
            inline_queue_servicing,
            depth: 0,
        }
    }

    /// Run the loop until the root token fires or the queue is closed and
    /// drained, then cancel whatever is left.
    pub(crate) fn run(mut self) {
        let _installed = self.dispatcher.install();
        let span = info_span!("headless_worker");
        let _entered = span.enter();
        info!("dispatch worker started");

        loop {
            crate::debug_trace!("waiting for work item");
            match self.queue.take_blocking(&self.root) {
                Take::Item(item) => self.execute(item),
                Take::Canceled => {
                    debug!("session token cancelled; worker stopping");
                    break;
                }
                Take::Closed => {
                    debug!("queue closed and drained; worker stopping");
                    break;
                }
            }
        }

        let tail = self.queue.drain();
        if !tail.is_empty() {
            debug!(count = tail.len(), "cancelling unexecuted items");
        }
        for item in tail {
            self.stats.item_canceled();
            item.abandon(DispatchError::Canceled);
        }

        let stats = self.stats.snapshot(self.dispatcher.callbacks_run());
        info!(
            items_executed = stats.items_executed,
            frames_pushed = stats.frames_pushed,
            "dispatch worker stopped"
        );
    }

    /// Execute one item: enter scope, restore context, run, release, record.
    pub(crate) fn execute(&mut self, item: WorkItem) {
        let WorkItem { id, context, mut job } = item;
        let _item_span = debug_span!("dispatch_item", item_id = id, depth = self.depth).entered();
        debug!(item_id = id, depth = self.depth, "executing work item");
        let _trace = ItemTrace::enter(id, self.depth);
        crate::debug_trace!("execute");

        let handle = match self.scope.enter(&self.dispatcher) {
            Ok(handle) => handle,
            Err(err) => {
                debug!(item_id = id, error = %err, "application scope unavailable");
                self.stats.scope_failed();
                job.abandon(DispatchError::ScopeFailed(err));
                return;
            }
        };

        self.depth += 1;
        {
            let _context = context.as_ref().map(ExecutionContext::enter);
            job.execute(self);
        }
        self.depth -= 1;

        let release = self.scope.exit(handle, &self.dispatcher);
        let outcome = job.settle(release);
        self.stats.item_executed();
        match outcome {
            ItemOutcome::Canceled => self.stats.item_canceled(),
            ItemOutcome::Faulted => self.stats.item_faulted(),
            ItemOutcome::ScopeFailed => self.stats.scope_failed(),
            ItemOutcome::Succeeded => {}
        }
        debug!(item_id = id, outcome = ?outcome, "work item finished");
        job.deliver();
    }

    /// Run the next queued item from inside a pump, when allowed.
    fn service_queue_inline(&mut self) -> bool {
        if !self.inline_queue_servicing {
            return false;
        }
        let Some(item) = self.queue.try_take() else {
            return false;
        };
        if self.root.is_canceled() {
            self.stats.item_canceled();
            item.abandon(DispatchError::Canceled);
            return true;
        }
        debug!(item_id = item.id, depth = self.depth, "servicing queued item inline");
        self.execute(item);
        true
    }

    fn pump(&self) -> NestedPump {
        NestedPump::new(self.dispatcher.clone(), Arc::clone(&self.stats))
    }
}
