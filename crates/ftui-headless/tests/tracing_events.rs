//! Structured logging emitted by a session.
//!
//! The worker logs from its own thread, so a capture layer is installed as
//! the global default. This file holds a single test to keep that global
//! state private to it.

use ftui_headless::{CancellationToken, Session};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;

#[derive(Debug, Clone)]
struct CapturedEvent {
    message: String,
    thread: Option<String>,
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

#[derive(Clone, Default)]
struct EventCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events.lock().unwrap().push(CapturedEvent {
            message: visitor.0,
            thread: std::thread::current().name().map(str::to_owned),
        });
    }
}

#[test]
fn session_lifecycle_is_logged() {
    let capture = EventCapture::default();
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::new("ftui_headless=debug"))
        .with(capture.clone());
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let session = Session::start_default().unwrap();
    assert_eq!(session.invoke(|| 1, &CancellationToken::none()).unwrap(), 1);
    session.dispose();

    let events = capture.events.lock().unwrap().clone();
    let find = |message: &str| events.iter().find(|e| e.message == message);

    assert!(find("dispatch session started").is_some());
    assert!(find("work item queued").is_some());
    let started = find("dispatch worker started").expect("worker start logged");
    assert_eq!(started.thread.as_deref(), Some("ftui-headless"));
    let finished = find("work item finished").expect("item outcome logged");
    assert_eq!(finished.thread.as_deref(), Some("ftui-headless"));
    assert!(find("dispatch worker stopped").is_some());
    assert!(find("disposing dispatch session").is_some());
}
