#![forbid(unsafe_code)]

//! Nested pump: block the worker on one pending action while still
//! servicing the dispatcher.
//!
//! A [`Frame`] is the stop signal for one pump invocation. It is stopped
//! exactly once, either by the action completing or by its linked
//! cancellation token. Frames stack: an action running inside a pump may
//! start an inner pump with its own frame, and each pump only watches its
//! own frame.
//!
//! The frame also acts as the waker for the pending future. Waking sets a
//! per-frame flag and nudges the dispatcher; the pump polls the future
//! again on its next turn through [`PumpHooks::on_wake`].

use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::stats::SessionStats;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

struct FrameSignal {
    stopped: AtomicBool,
    woken: AtomicBool,
    dispatcher: DispatcherHandle,
}

impl FrameSignal {
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.dispatcher.wake();
        }
    }
}

impl Wake for FrameSignal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        self.dispatcher.wake();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame
// ─────────────────────────────────────────────────────────────────────────────

/// Stop signal and waker for one nested pump.
pub struct Frame {
    signal: Arc<FrameSignal>,
}

impl Frame {
    /// Create a frame bound to `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: DispatcherHandle) -> Self {
        Self {
            signal: Arc::new(FrameSignal {
                stopped: AtomicBool::new(false),
                woken: AtomicBool::new(false),
                dispatcher,
            }),
        }
    }

    /// Waker that schedules another poll in this frame's pump.
    #[must_use]
    pub fn waker(&self) -> Waker {
        Waker::from(Arc::clone(&self.signal))
    }

    /// Cross-thread handle that can stop this frame.
    #[must_use]
    pub fn stopper(&self) -> FrameStopper {
        FrameStopper {
            signal: Arc::clone(&self.signal),
        }
    }

    /// Ask the pump running this frame to exit.
    pub fn stop(&self) {
        self.signal.stop();
    }

    /// Whether the frame has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.signal.stopped.load(Ordering::Acquire)
    }

    fn take_woken(&self) -> bool {
        self.signal.woken.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// `Send` handle that stops a [`Frame`] from any thread.
#[derive(Clone)]
pub struct FrameStopper {
    signal: Arc<FrameSignal>,
}

impl FrameStopper {
    /// Stop the frame. Only the first call has an effect.
    pub fn stop(&self) {
        self.signal.stop();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pump
// ─────────────────────────────────────────────────────────────────────────────

/// Callbacks driven by [`NestedPump::run`].
pub trait PumpHooks {
    /// The frame's waker fired. Poll whatever the frame is waiting for and
    /// stop the frame once it is done.
    fn on_wake(&mut self, frame: &Frame);

    /// Nothing else was ready. Return `true` if some work was done so the
    /// pump turns again instead of parking.
    fn on_idle(&mut self) -> bool {
        false
    }
}

/// Re-entrant event loop running on the worker thread.
#[derive(Clone)]
pub struct NestedPump {
    dispatcher: Dispatcher,
    stats: Arc<SessionStats>,
}

impl NestedPump {
    pub(crate) fn new(dispatcher: Dispatcher, stats: Arc<SessionStats>) -> Self {
        Self { dispatcher, stats }
    }

    /// Service the dispatcher until `frame` is stopped.
    ///
    /// Each turn: re-poll if the frame was woken, run ready dispatcher
    /// callbacks, give the idle hook a chance, then park until something
    /// new arrives.
    pub fn run(&self, frame: &Frame, hooks: &mut dyn PumpHooks) {
        let depth = self.stats.frame_pushed();
        tracing::trace!(depth, "nested pump entered");
        crate::debug_trace!("push frame depth={}", depth);

        let mut turns: u64 = 0;
        while !frame.is_stopped() {
            turns += 1;
            if frame.take_woken() {
                hooks.on_wake(frame);
                if frame.is_stopped() {
                    break;
                }
            }

            let ran = self.dispatcher.run_pending();
            if frame.is_stopped() {
                break;
            }
            let idle_work = ran == 0 && hooks.on_idle();
            if ran == 0 && !idle_work && !frame.signal.woken.load(Ordering::Acquire) {
                self.dispatcher.wait_for_work();
            }
        }

        self.stats.frame_completed();
        tracing::trace!(depth, turns, "nested pump exited");
        crate::debug_trace!("pop frame depth={} turns={}", depth, turns);
    }
}

impl fmt::Debug for NestedPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedPump")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cooperative helpers for async actions
// ─────────────────────────────────────────────────────────────────────────────

/// Yield once to the pump.
///
/// The first poll wakes itself and returns `Pending`; the second completes.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Complete after `duration`, using a timer on the current dispatcher.
///
/// Off the worker thread (no current dispatcher) the timer is a plain
/// background sleep.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        fired: None,
    }
}

/// Future returned by [`sleep`].
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    duration: Duration,
    fired: Option<Arc<AtomicBool>>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(fired) = &self.fired {
            return if fired.load(Ordering::Acquire) {
                Poll::Ready(())
            } else {
                Poll::Pending
            };
        }

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let waker = cx.waker().clone();
        let on_fire = move || {
            flag.store(true, Ordering::Release);
            waker.wake();
        };
        match Dispatcher::current() {
            Some(dispatcher) => dispatcher.post_after(self.duration, on_fire),
            None => {
                let duration = self.duration;
                std::thread::spawn(move || {
                    std::thread::sleep(duration);
                    on_fire();
                });
            }
        }
        self.fired = Some(fired);
        Poll::Pending
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("duration", &self.duration)
            .field("armed", &self.fired.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::completion;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct PollFuture<F: Future> {
        future: Pin<Box<F>>,
        output: Option<F::Output>,
        polls: usize,
    }

    impl<F: Future> PumpHooks for PollFuture<F> {
        fn on_wake(&mut self, frame: &Frame) {
            self.polls += 1;
            let waker = frame.waker();
            let mut cx = Context::from_waker(&waker);
            if let Poll::Ready(v) = self.future.as_mut().poll(&mut cx) {
                self.output = Some(v);
                frame.stop();
            }
        }
    }

    fn pump() -> (NestedPump, Dispatcher, Arc<SessionStats>) {
        let dispatcher = Dispatcher::new();
        let stats = Arc::new(SessionStats::default());
        (
            NestedPump::new(dispatcher.clone(), Arc::clone(&stats)),
            dispatcher,
            stats,
        )
    }

    fn drive<F: Future>(pump: &NestedPump, frame: &Frame, future: F) -> PollFuture<F> {
        let mut hooks = PollFuture {
            future: Box::pin(future),
            output: None,
            polls: 0,
        };
        frame.waker().wake_by_ref();
        pump.run(frame, &mut hooks);
        hooks
    }

    #[test]
    fn pump_polls_until_ready_after_yields() {
        let (pump, dispatcher, stats) = pump();
        let frame = Frame::new(dispatcher.handle());
        let hooks = drive(&pump, &frame, async {
            for _ in 0..3 {
                yield_now().await;
            }
            7
        });
        assert_eq!(hooks.output, Some(7));
        assert_eq!(hooks.polls, 4);
        let snap = stats.snapshot(0);
        assert_eq!(snap.frames_pushed, 1);
        assert_eq!(snap.frames_completed, 1);
    }

    #[test]
    fn pump_runs_posted_callbacks_while_waiting() {
        let (pump, dispatcher, _stats) = pump();
        let frame = Frame::new(dispatcher.handle());
        let (tx, rx) = completion::<u32>();
        let handle = dispatcher.handle();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        handle.post(move || {
            h.fetch_add(1, Ordering::SeqCst);
            tx.succeed(11);
        });
        let hooks = drive(&pump, &frame, rx);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.output.unwrap().unwrap(), 11);
    }

    #[test]
    fn cross_thread_stop_exits_pump() {
        let (pump, dispatcher, _stats) = pump();
        let frame = Frame::new(dispatcher.handle());
        let stopper = frame.stopper();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            stopper.stop();
        });
        let hooks = drive(&pump, &frame, std::future::pending::<()>());
        assert!(frame.is_stopped());
        assert!(hooks.output.is_none());
        t.join().unwrap();
    }

    #[test]
    fn stop_before_run_returns_immediately() {
        let (pump, dispatcher, stats) = pump();
        let frame = Frame::new(dispatcher.handle());
        frame.stop();
        let hooks = drive(&pump, &frame, std::future::pending::<()>());
        assert_eq!(hooks.polls, 0);
        assert_eq!(stats.snapshot(0).frames_completed, 1);
    }

    #[test]
    fn sleep_fires_through_dispatcher_timer() {
        let (pump, dispatcher, _stats) = pump();
        let _installed = dispatcher.install();
        let frame = Frame::new(dispatcher.handle());
        let hooks = drive(&pump, &frame, async {
            sleep(Duration::from_millis(5)).await;
            "slept"
        });
        assert_eq!(hooks.output, Some("slept"));
        assert!(dispatcher.callbacks_run() >= 1);
    }

    #[test]
    fn nested_frames_track_depth() {
        struct Outer<'a> {
            pump: &'a NestedPump,
            inner_done: bool,
        }
        impl PumpHooks for Outer<'_> {
            fn on_wake(&mut self, frame: &Frame) {
                if !self.inner_done {
                    let inner = Frame::new(self.pump.dispatcher.handle());
                    let hooks = drive(self.pump, &inner, async { yield_now().await });
                    assert!(hooks.output.is_some());
                    self.inner_done = true;
                }
                frame.stop();
            }
        }
        let (pump, dispatcher, stats) = pump();
        let frame = Frame::new(dispatcher.handle());
        let mut outer = Outer {
            pump: &pump,
            inner_done: false,
        };
        frame.waker().wake_by_ref();
        pump.run(&frame, &mut outer);
        let snap = stats.snapshot(0);
        assert_eq!(snap.frames_pushed, 2);
        assert_eq!(snap.max_frame_depth, 2);
        assert_eq!(snap.frame_depth, 0);
    }
}
