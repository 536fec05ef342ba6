//! Callback adapter: moves native-thread notifications into the
//! consumer's context.
//!
//! Two delivery strategies exist. `Direct` calls consumer code straight
//! from the native worker thread, which is what blocking and callback runs
//! want. `Queued` posts every notification onto a channel that a
//! [`Deferred`] drains from whichever task awaits it, so consumer hooks
//! and the resolution itself run on the event loop, in emission order.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, event, warn, Level};

use crate::error::{BridgeError, Result};
use crate::handle::{Liveness, TestHandle};
use crate::kind::TestKind;
use crate::native::{lock, EntryHook, LogHook};
use crate::verbosity::tracing_level;

pub type LogCallback = Arc<dyn Fn(u32, &str) + Send + Sync>;
pub type EntryCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A notification crossing from a native thread to the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Log { severity: u32, line: String },
    Entry(String),
    Complete,
}

pub(crate) enum Delivery {
    Direct,
    Queued(mpsc::UnboundedSender<Event>),
}

/// Run consumer code, containing any panic so it never unwinds into the
/// native library.
pub(crate) fn guarded(what: &'static str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(callback = what, panic = %msg, "consumer callback panicked");
            false
        }
    }
}

/// Parse a raw entry into structured data.
pub fn decode_entry(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| BridgeError::MalformedEntry {
        reason: e.to_string(),
        raw: raw.to_string(),
    })
}

fn forward_to_tracing(kind: TestKind, severity: u32, line: &str) {
    let level = tracing_level(severity);
    if level == Level::WARN {
        event!(target: "mkbridge::native", Level::WARN, %kind, "{}", line);
    } else if level == Level::INFO {
        event!(target: "mkbridge::native", Level::INFO, %kind, "{}", line);
    } else if level == Level::DEBUG {
        event!(target: "mkbridge::native", Level::DEBUG, %kind, "{}", line);
    } else {
        event!(target: "mkbridge::native", Level::TRACE, %kind, "{}", line);
    }
}

// ---------------------------------------------------------------------------
// CompletionToken
// ---------------------------------------------------------------------------

/// Single-fire completion signal.
///
/// Holds the completion action until the first `fire`; later calls are
/// rejected and reported.
pub struct CompletionToken {
    kind: TestKind,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CompletionToken {
    pub fn new(kind: TestKind, action: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            kind,
            action: Mutex::new(Some(Box::new(action))),
        })
    }

    /// Fire the token. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        let action = lock(&self.action).take();
        match action {
            Some(action) => {
                debug!(kind = %self.kind, "run complete");
                guarded("on_complete", action);
                true
            }
            None => {
                warn!(kind = %self.kind, "completion signalled more than once, ignored");
                false
            }
        }
    }

    pub fn has_fired(&self) -> bool {
        lock(&self.action).is_none()
    }
}

// ---------------------------------------------------------------------------
// CallbackAdapter
// ---------------------------------------------------------------------------

/// Consumer hooks captured for one run, ready to be installed natively.
pub(crate) struct CallbackAdapter {
    kind: TestKind,
    log: Option<LogCallback>,
    entry: Option<EntryCallback>,
    alive: Liveness,
}

impl CallbackAdapter {
    pub(crate) fn new(
        handle: &TestHandle,
        log: Option<LogCallback>,
        entry: Option<EntryCallback>,
    ) -> Self {
        Self {
            kind: handle.kind(),
            log,
            entry,
            alive: handle.liveness(),
        }
    }

    pub(crate) fn install(&self, handle: &TestHandle, delivery: &Delivery) -> Result<()> {
        let raw = handle.raw()?;
        let lib = handle.library();
        lib.on_log(raw, self.log_hook(delivery))?;
        if let Some(hook) = self.entry_hook(delivery) {
            lib.on_entry(raw, hook)?;
        }
        Ok(())
    }

    fn log_hook(&self, delivery: &Delivery) -> LogHook {
        match delivery {
            Delivery::Direct => {
                let alive = self.alive.clone();
                let consumer = self.log.clone();
                let kind = self.kind;
                Arc::new(move |severity: u32, line: &str| {
                    if !alive.is_alive() {
                        return;
                    }
                    match &consumer {
                        Some(cb) => {
                            guarded("on_log", || cb(severity, line));
                        }
                        None => forward_to_tracing(kind, severity, line),
                    }
                })
            }
            Delivery::Queued(tx) => {
                let tx = tx.clone();
                let kind = self.kind;
                Arc::new(move |severity: u32, line: &str| {
                    let event = Event::Log {
                        severity,
                        line: line.to_string(),
                    };
                    if tx.send(event).is_err() {
                        warn!(%kind, "event loop gone, log line dropped");
                    }
                })
            }
        }
    }

    fn entry_hook(&self, delivery: &Delivery) -> Option<EntryHook> {
        match delivery {
            Delivery::Direct => {
                let consumer = self.entry.clone()?;
                let alive = self.alive.clone();
                Some(Arc::new(move |raw: &str| {
                    if alive.is_alive() {
                        guarded("on_entry", || consumer(raw));
                    }
                }))
            }
            Delivery::Queued(tx) => {
                let tx = tx.clone();
                let kind = self.kind;
                Some(Arc::new(move |raw: &str| {
                    if tx.send(Event::Entry(raw.to_string())).is_err() {
                        warn!(%kind, "event loop gone, entry dropped");
                    }
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Deferred
// ---------------------------------------------------------------------------

/// What a deferred run resolves with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    /// Decoded entries, in emission order.
    pub entries: Vec<Value>,
    /// Entries that failed to decode.
    pub errors: Vec<BridgeError>,
}

/// Future returned by `run_deferred`.
///
/// Polling drains the run's event queue on the polling task: consumer
/// hooks fire there, entries are decoded there, and the future resolves
/// there once the completion event arrives. Resolves with `RunAbandoned`
/// if the native side releases the run without completing it.
///
/// Events are buffered, unbounded, until the future is polled; hold it
/// unpolled and every log line and entry of the run stays queued.
#[must_use = "a deferred run delivers nothing unless awaited"]
pub struct Deferred {
    kind: TestKind,
    rx: mpsc::UnboundedReceiver<Event>,
    log: Option<LogCallback>,
    entry: Option<EntryCallback>,
    alive: Liveness,
    outcome: Option<RunOutcome>,
}

impl Deferred {
    pub(crate) fn new(
        kind: TestKind,
        rx: mpsc::UnboundedReceiver<Event>,
        log: Option<LogCallback>,
        entry: Option<EntryCallback>,
        alive: Liveness,
    ) -> Self {
        Self {
            kind,
            rx,
            log,
            entry,
            alive,
            outcome: Some(RunOutcome::default()),
        }
    }

    fn deliver_log(&self, severity: u32, line: &str) {
        if !self.alive.is_alive() {
            return;
        }
        match &self.log {
            Some(cb) => {
                guarded("on_log", || cb(severity, line));
            }
            None => forward_to_tracing(self.kind, severity, line),
        }
    }

    fn deliver_entry(&mut self, raw: String) {
        if let Some(cb) = &self.entry {
            if self.alive.is_alive() {
                guarded("on_entry", || cb(&raw));
            }
        }
        let Some(outcome) = self.outcome.as_mut() else {
            return;
        };
        match decode_entry(&raw) {
            Ok(value) => outcome.entries.push(value),
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "entry could not be decoded");
                outcome.errors.push(e);
            }
        }
    }
}

impl Future for Deferred {
    type Output = Result<RunOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Event::Log { severity, line })) => {
                    this.deliver_log(severity, &line)
                }
                Poll::Ready(Some(Event::Entry(raw))) => this.deliver_entry(raw),
                Poll::Ready(Some(Event::Complete)) => {
                    let outcome = this.outcome.take().unwrap_or_default();
                    debug!(
                        kind = %this.kind,
                        entries = outcome.entries.len(),
                        errors = outcome.errors.len(),
                        "deferred run resolved"
                    );
                    return Poll::Ready(Ok(outcome));
                }
                Poll::Ready(None) => {
                    warn!(kind = %this.kind, "run released without completion");
                    return Poll::Ready(Err(BridgeError::RunAbandoned));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred").field("kind", &self.kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::loopback::LoopbackLibrary;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn live_handle() -> TestHandle {
        TestHandle::create(Arc::new(LoopbackLibrary::new()), TestKind::Ndt).unwrap()
    }

    #[test]
    fn test_completion_token_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let token = CompletionToken::new(TestKind::Ndt, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!token.has_fired());
        assert!(token.fire());
        assert!(!token.fire());
        assert!(token.has_fired());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_token_contains_panic() {
        let token = CompletionToken::new(TestKind::Ndt, || panic!("boom"));
        assert!(token.fire());
        assert!(token.has_fired());
    }

    #[test]
    fn test_decode_entry_matches_serde_json() {
        let raw = r#"{"test_name":"tcp_connect","test_keys":{"connection":"success"}}"#;
        let expected: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(decode_entry(raw).unwrap(), expected);
    }

    #[test]
    fn test_decode_entry_rejects_garbage() {
        match decode_entry("{not json") {
            Err(BridgeError::MalformedEntry { raw, .. }) => assert_eq!(raw, "{not json"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_guarded_reports_panics() {
        assert!(guarded("test", || {}));
        assert!(!guarded("test", || panic!("contained")));
    }

    #[tokio::test]
    async fn test_deferred_drains_in_order_and_collects_errors() {
        let handle = live_handle();
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let logs = seen.clone();
        let entries = seen.clone();
        let deferred = Deferred::new(
            TestKind::Ndt,
            rx,
            Some(Arc::new(move |_: u32, line: &str| {
                logs.lock().unwrap().push(format!("log:{}", line))
            })),
            Some(Arc::new(move |raw: &str| {
                entries.lock().unwrap().push(format!("entry:{}", raw))
            })),
            handle.liveness(),
        );

        tx.send(Event::Log { severity: 1, line: "a".into() }).unwrap();
        tx.send(Event::Entry("{\"n\":1}".into())).unwrap();
        tx.send(Event::Entry("garbage".into())).unwrap();
        tx.send(Event::Log { severity: 1, line: "b".into() }).unwrap();
        tx.send(Event::Complete).unwrap();

        let outcome = deferred.await.unwrap();
        assert_eq!(outcome.entries, vec![serde_json::json!({"n": 1})]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["log:a", "entry:{\"n\":1}", "entry:garbage", "log:b"]
        );
    }

    #[tokio::test]
    async fn test_deferred_buffers_events_until_polled() {
        let handle = live_handle();
        let (tx, rx) = mpsc::unbounded_channel();
        let deferred = Deferred::new(TestKind::Ndt, rx, None, None, handle.liveness());
        for n in 0..500 {
            tx.send(Event::Entry(format!("{{\"n\":{}}}", n))).unwrap();
        }
        tx.send(Event::Complete).unwrap();
        drop(tx);

        let outcome = deferred.await.unwrap();
        assert_eq!(outcome.entries.len(), 500);
        assert_eq!(outcome.entries[499], serde_json::json!({"n": 499}));
    }

    #[tokio::test]
    async fn test_deferred_abandoned_when_senders_drop() {
        let handle = live_handle();
        let (tx, rx) = mpsc::unbounded_channel();
        let deferred = Deferred::new(TestKind::Ndt, rx, None, None, handle.liveness());
        tx.send(Event::Entry("{}".into())).unwrap();
        drop(tx);
        assert_eq!(deferred.await, Err(BridgeError::RunAbandoned));
    }

    #[tokio::test]
    async fn test_deferred_skips_consumer_hooks_after_destroy() {
        let mut handle = live_handle();
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let deferred = Deferred::new(
            TestKind::Ndt,
            rx,
            None,
            Some(Arc::new(move |_: &str| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
            handle.liveness(),
        );
        tx.send(Event::Entry("{}".into())).unwrap();
        tx.send(Event::Complete).unwrap();
        handle.destroy();

        let outcome = deferred.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.entries.len(), 1);
    }
}
