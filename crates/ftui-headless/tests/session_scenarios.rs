//! End-to-end dispatch scenarios.
//!
//! # Running Tests
//!
//! ```sh
//! cargo test -p ftui-headless --test session_scenarios
//! ```
//!
//! # Invariants
//!
//! 1. **Fast path**: a synchronous action never enters the nested pump.
//! 2. **Single pump**: an asynchronous action pumps exactly one frame.
//! 3. **Contained faults**: a panicking action faults only its own handle.
//! 4. **Worker affinity**: every action runs on the session thread.

use ftui_headless::pump::{sleep, yield_now};
use ftui_headless::{
    AppBuilder, BoxError, CancellationToken, Dispatcher, DispatchError, ScopeError, Session,
    SessionConfig, completion, context, scope,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::Level;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init();
}

fn none() -> CancellationToken {
    CancellationToken::none()
}

// ============================================================================
// 1. Basic scenario
// ============================================================================

#[test]
fn sync_then_async_then_dispose() {
    init_tracing();
    let session = Session::start_default().unwrap();

    let sum = session.dispatch(|| 2 + 2, &none()).unwrap();
    assert_eq!(sum.wait().unwrap(), 4);
    assert_eq!(session.stats().frames_pushed, 0, "sync action must not pump");

    let (completer, gate) = completion::<()>();
    let pending = session
        .dispatch_async(
            move || async move {
                gate.await.unwrap();
                "done"
            },
            &none(),
        )
        .unwrap();

    let pending = pending
        .wait_timeout(Duration::from_millis(50))
        .expect_err("must stay unresolved until the gate completes");
    assert!(!pending.is_completed());

    completer.succeed(());
    assert_eq!(pending.wait().unwrap(), "done");

    let stats = session.stats();
    assert_eq!(stats.frames_pushed, 1);
    assert_eq!(stats.frames_completed, 1);

    session.dispose();
    assert!(matches!(
        session.dispatch(|| 0, &none()),
        Err(DispatchError::SessionDisposed)
    ));
}

#[test]
fn yields_complete_with_final_value() {
    let session = Session::start_default().unwrap();
    let value = session
        .invoke_async(
            || async {
                let mut total = 0;
                for i in 1..=5 {
                    yield_now().await;
                    total += i;
                }
                total
            },
            &none(),
        )
        .unwrap();
    assert_eq!(value, 15);
    assert_eq!(session.stats().frames_pushed, 1);
    assert_eq!(session.stats().max_frame_depth, 1);
}

#[test]
fn dispatch_action_runs_side_effect() {
    let session = Session::start_default().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    session
        .dispatch_action(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }, &none())
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

// ============================================================================
// 2. Worker affinity and ordering
// ============================================================================

#[test]
fn every_action_runs_on_worker_thread() {
    let session = Session::start(
        SessionConfig::default().with_thread_name("affinity-worker"),
        || Ok(ftui_headless::HeadlessApp),
    )
    .unwrap();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            session
                .dispatch(|| thread::current().name().map(str::to_owned), &none())
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.wait().unwrap().as_deref(), Some("affinity-worker"));
    }
}

#[test]
fn actions_never_overlap() {
    let session = Arc::new(Session::start_default().unwrap());
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let session = Arc::clone(&session);
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            thread::spawn(move || {
                (0..25)
                    .map(|_| {
                        let active = Arc::clone(&active);
                        let overlaps = Arc::clone(&overlaps);
                        session
                            .dispatch_action(
                                move || {
                                    if active.fetch_add(1, Ordering::SeqCst) != 0 {
                                        overlaps.fetch_add(1, Ordering::SeqCst);
                                    }
                                    thread::yield_now();
                                    active.fetch_sub(1, Ordering::SeqCst);
                                },
                                &CancellationToken::none(),
                            )
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for producer in producers {
        for pending in producer.join().unwrap() {
            pending.wait().unwrap();
        }
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(session.stats().items_executed, 100);
}

// ============================================================================
// 3. Faults
// ============================================================================

#[test]
fn panicking_action_faults_only_itself() {
    let session = Session::start_default().unwrap();

    let bad = session
        .dispatch(|| -> u32 { panic!("widget exploded") }, &none())
        .unwrap();
    let good = session.dispatch(|| 9_u32, &none()).unwrap();

    let err = bad.wait().unwrap_err();
    assert!(err.is_fault());
    let fault = err.into_fault().unwrap();
    assert_eq!(fault.message(), "widget exploded");
    assert_eq!(good.wait().unwrap(), 9);
    assert_eq!(session.stats().items_faulted, 1);
}

#[test]
fn fault_resumes_original_panic() {
    let session = Session::start_default().unwrap();
    let err = session
        .invoke(|| -> u8 { panic!("original payload") }, &none())
        .unwrap_err();
    let fault = err.into_fault().unwrap();
    let payload = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        fault.resume();
    }))
    .unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"original payload"));
}

#[test]
fn panicking_future_faults_after_pumping() {
    let session = Session::start_default().unwrap();
    let err = session
        .invoke_async(
            || async {
                yield_now().await;
                let fail = true;
                if fail {
                    panic!("late failure");
                }
                0_u8
            },
            &none(),
        )
        .unwrap_err();
    assert_eq!(err.into_fault().unwrap().message(), "late failure");
    assert_eq!(session.invoke(|| "still alive", &none()).unwrap(), "still alive");
}

// ============================================================================
// 4. Dispatcher callbacks and timers inside the pump
// ============================================================================

#[test]
fn pump_runs_posted_callbacks() {
    let session = Session::start_default().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&order);

    session
        .invoke_async(
            move || async move {
                let dispatcher = Dispatcher::current().expect("worker has a dispatcher");
                for i in 0..3 {
                    let log = Arc::clone(&log);
                    dispatcher.post(move || log.lock().unwrap().push(i));
                }
                let (done, signal) = completion::<()>();
                dispatcher.post(move || done.succeed(()));
                signal.await.unwrap();
            },
            &none(),
        )
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    assert!(session.stats().callbacks_run >= 4);
}

#[test]
fn sleep_uses_dispatcher_timer() {
    let session = Session::start_default().unwrap();
    let start = Instant::now();
    let elapsed = session
        .invoke_async(
            move || async move {
                sleep(Duration::from_millis(20)).await;
                start.elapsed()
            },
            &none(),
        )
        .unwrap();
    assert!(elapsed >= Duration::from_millis(20));
}

#[test]
fn external_post_reaches_running_pump() {
    let session = Session::start_default().unwrap();
    let handle = session.dispatcher();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let (done, signal) = completion::<&'static str>();

    let pending = session
        .dispatch_async(
            move || async move {
                ready_tx.send(()).unwrap();
                signal.await.unwrap()
            },
            &none(),
        )
        .unwrap();

    ready_rx.recv().unwrap();
    handle.post(move || done.succeed("from outside"));
    assert_eq!(pending.wait().unwrap(), "from outside");
}

#[test]
fn unbounded_timer_stays_armed() {
    let session = Session::start_default().unwrap();
    session.dispatcher().post_after(Duration::MAX, || {});
    assert_eq!(session.dispatcher().pending_count(), 1);

    // The worker keeps serving items with a never-due timer armed.
    assert_eq!(session.invoke(|| 4, &none()).unwrap(), 4);
    let value = session
        .invoke_async(
            || async {
                yield_now().await;
                5
            },
            &none(),
        )
        .unwrap();
    assert_eq!(value, 5);
}

// ============================================================================
// 5. Application scope
// ============================================================================

struct CountingApp {
    setups: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
    fail_after: usize,
}

impl AppBuilder for CountingApp {
    fn setup(&mut self) -> Result<(), BoxError> {
        let n = self.setups.fetch_add(1, Ordering::SeqCst) + 1;
        if n > self.fail_after {
            return Err(format!("setup #{n} refused").into());
        }
        context::set_value("app", n);
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), BoxError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn scope_wraps_each_item() {
    let setups = Arc::new(AtomicUsize::new(0));
    let teardowns = Arc::new(AtomicUsize::new(0));
    let (s, t) = (Arc::clone(&setups), Arc::clone(&teardowns));
    let session = Session::start(SessionConfig::default(), move || {
        Ok(CountingApp {
            setups: s,
            teardowns: t,
            fail_after: usize::MAX,
        })
    })
    .unwrap();

    for expected in 1..=3_usize {
        let seen = session
            .invoke(
                || (scope::is_active(), context::value::<usize>("app").map(|v| *v)),
                &none(),
            )
            .unwrap();
        assert_eq!(seen, (true, Some(expected)));
    }
    assert_eq!(setups.load(Ordering::SeqCst), 3);
    assert_eq!(teardowns.load(Ordering::SeqCst), 3);
    assert!(!scope::is_active(), "caller thread never enters the scope");
}

#[test]
fn scope_setup_failure_is_contained() {
    let setups = Arc::new(AtomicUsize::new(0));
    let teardowns = Arc::new(AtomicUsize::new(0));
    let (s, t) = (Arc::clone(&setups), Arc::clone(&teardowns));
    let session = Session::start(SessionConfig::default(), move || {
        Ok(CountingApp {
            setups: s,
            teardowns: t,
            fail_after: 1,
        })
    })
    .unwrap();

    assert_eq!(session.invoke(|| 1, &none()).unwrap(), 1);
    let err = session.invoke(|| 2, &none()).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::ScopeFailed(ScopeError::Setup(ref msg)) if msg == "setup #2 refused"
    ));
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert!(!session.is_disposed());

    let stats = session.stats();
    assert_eq!(stats.items_executed, 1);
    assert_eq!(stats.scope_failures, 1);
}

/// Teardown fails while `failing` is set.
struct FlakyTeardownApp {
    failing: Arc<AtomicBool>,
}

impl AppBuilder for FlakyTeardownApp {
    fn setup(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), BoxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err("td".into());
        }
        Ok(())
    }
}

#[test]
fn teardown_failure_after_action() {
    let failing = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&failing);
    let session = Session::start(SessionConfig::default(), move || {
        Ok(FlakyTeardownApp { failing: flag })
    })
    .unwrap();

    // The action's value is replaced by the release failure.
    let err = session.invoke(|| 1, &none()).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::ScopeFailed(ScopeError::Teardown(ref msg)) if msg == "td"
    ));

    // A fault outranks the release failure.
    let err = session
        .invoke(|| -> u8 { panic!("action broke") }, &none())
        .unwrap_err();
    assert!(matches!(err, DispatchError::Faulted(ref fault) if fault.message() == "action broke"));

    failing.store(false, Ordering::SeqCst);
    assert_eq!(session.invoke(|| 3, &none()).unwrap(), 3);

    let stats = session.stats();
    assert_eq!(stats.items_executed, 3);
    assert_eq!(stats.items_faulted, 1);
    assert_eq!(stats.scope_failures, 1);
}

#[test]
fn bootstrap_runs_on_worker_thread() {
    let seen = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);
    let session = Session::start(
        SessionConfig::default().with_thread_name("bootstrap-thread"),
        move || {
            *record.lock().unwrap() = thread::current().name().map(str::to_owned);
            Ok(ftui_headless::HeadlessApp)
        },
    )
    .unwrap();
    assert_eq!(seen.lock().unwrap().as_deref(), Some("bootstrap-thread"));
    session.dispose();
}
