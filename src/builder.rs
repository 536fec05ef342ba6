//! Fluent test configuration and the three execution modes.
//!
//! ```ignore
//! let mut test = binding.create(TestKind::TcpConnect)?;
//! test.set_option("port", "80")?
//!     .set_input_path("hosts.txt")?
//!     .on_entry(|entry| println!("{entry}"))?;
//! let outcome = test.run_deferred()?.await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::adapter::{
    CallbackAdapter, CompletionToken, Deferred, Delivery, EntryCallback, Event, LogCallback,
};
use crate::error::{BridgeError, Result};
use crate::handle::TestHandle;
use crate::kind::TestKind;
use crate::native::{NativeLibrary, RawHandle};
use crate::verbosity::Verbosity;

// ---------------------------------------------------------------------------
// OptionSet
// ---------------------------------------------------------------------------

/// String options, last write wins per key. Keys keep the position of
/// their first write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptionSet {
    entries: Vec<(String, String)>,
}

impl OptionSet {
    /// Insert or overwrite, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => Some(std::mem::replace(&mut slot.1, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Local mirror of everything forwarded to the native handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestConfig {
    pub kind: TestKind,
    pub options: OptionSet,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub verbosity: Verbosity,
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Configured,
    Running,
    Completed,
}

const CONFIGURED: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Arc<Self> {
        Arc::new(StateCell(AtomicU8::new(CONFIGURED)))
    }

    fn get(&self) -> RunState {
        match self.0.load(Ordering::Acquire) {
            CONFIGURED => RunState::Configured,
            RUNNING => RunState::Running,
            _ => RunState::Completed,
        }
    }

    /// Configured -> Running. Fails if the test was ever started.
    fn start(&self) -> Result<()> {
        self.0
            .compare_exchange(CONFIGURED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| BridgeError::AlreadyStarted)
    }

    fn complete(&self) {
        self.0.store(COMPLETED, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// NetTest
// ---------------------------------------------------------------------------

/// A configurable, runnable test backed by one native handle.
///
/// The handle is destroyed when the `NetTest` is dropped or
/// [`destroy`](NetTest::destroy)ed; that is legal at any point, including
/// while a run is in flight.
pub struct NetTest {
    handle: TestHandle,
    config: TestConfig,
    log: Option<LogCallback>,
    entry: Option<EntryCallback>,
    state: Arc<StateCell>,
}

impl NetTest {
    pub(crate) fn create(lib: Arc<dyn NativeLibrary>, kind: TestKind) -> Result<Self> {
        let handle = TestHandle::create(lib, kind)?;
        Ok(Self {
            handle,
            config: TestConfig {
                kind,
                options: OptionSet::default(),
                input_path: None,
                output_path: None,
                verbosity: Verbosity::default(),
            },
            log: None,
            entry: None,
            state: StateCell::new(),
        })
    }

    pub fn kind(&self) -> TestKind {
        self.config.kind
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.is_destroyed()
    }

    /// Raw handle, provided the test can still be configured.
    fn configurable(&self) -> Result<RawHandle> {
        let raw = self.handle.raw()?;
        if self.state.get() != RunState::Configured {
            return Err(BridgeError::AlreadyStarted);
        }
        Ok(raw)
    }

    fn lib(&self) -> &Arc<dyn NativeLibrary> {
        self.handle.library()
    }

    pub fn set_option(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self> {
        let raw = self.configurable()?;
        let (key, value) = (key.into(), value.into());
        self.lib().set_option(raw, &key, &value)?;
        debug!(kind = %self.kind(), %key, %value, "option set");
        self.config.options.insert(key, value);
        Ok(self)
    }

    pub fn set_input_path(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let raw = self.configurable()?;
        let path = path.as_ref();
        self.lib().set_input_path(raw, path)?;
        self.config.input_path = Some(path.to_path_buf());
        Ok(self)
    }

    pub fn set_output_path(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let raw = self.configurable()?;
        let path = path.as_ref();
        self.lib().set_output_path(raw, path)?;
        self.config.output_path = Some(path.to_path_buf());
        Ok(self)
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) -> Result<&mut Self> {
        let raw = self.configurable()?;
        self.lib().set_verbosity(raw, verbosity.bits())?;
        self.config.verbosity = verbosity;
        Ok(self)
    }

    pub fn increase_verbosity(&mut self) -> Result<&mut Self> {
        let raw = self.configurable()?;
        self.lib().increase_verbosity(raw)?;
        self.config.verbosity = self.config.verbosity.increased();
        Ok(self)
    }

    /// Receive every native log line as `(severity, line)`.
    ///
    /// Without a log callback, native lines go to `tracing` under the
    /// `mkbridge::native` target.
    pub fn on_log<F>(&mut self, callback: F) -> Result<&mut Self>
    where
        F: Fn(u32, &str) + Send + Sync + 'static,
    {
        self.configurable()?;
        self.log = Some(Arc::new(callback));
        Ok(self)
    }

    /// Receive every raw entry as produced by the native library.
    pub fn on_entry<F>(&mut self, callback: F) -> Result<&mut Self>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.configurable()?;
        self.entry = Some(Arc::new(callback));
        Ok(self)
    }

    /// Configured -> Running, installing hooks for `delivery`.
    fn start(&mut self, delivery: &Delivery) -> Result<RawHandle> {
        let raw = self.configurable()?;
        CallbackAdapter::new(&self.handle, self.log.clone(), self.entry.clone())
            .install(&self.handle, delivery)?;
        self.state.start()?;
        Ok(raw)
    }

    /// Run and block the calling thread until the test completes.
    pub fn run(&mut self) -> Result<()> {
        let raw = self.start(&Delivery::Direct)?;
        info!(kind = %self.kind(), "running test");
        let result = self.lib().run(raw);
        self.state.complete();
        info!(kind = %self.kind(), ok = result.is_ok(), "test finished");
        result
    }

    /// Start the test and return immediately. `on_complete` runs exactly
    /// once, on a native thread, when the test completes.
    pub fn run_async<F>(&mut self, on_complete: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let raw = self.start(&Delivery::Direct)?;
        let state = self.state.clone();
        let token = CompletionToken::new(self.kind(), move || {
            state.complete();
            on_complete();
        });
        info!(kind = %self.kind(), "starting test in background");
        self.launch(raw, token)
    }

    /// Start the test and return a future resolving on the task that
    /// awaits it, with the decoded entries of the run.
    pub fn run_deferred(&mut self) -> Result<Deferred> {
        let (tx, rx) = mpsc::unbounded_channel();
        let raw = self.start(&Delivery::Queued(tx.clone()))?;
        let state = self.state.clone();
        let kind = self.kind();
        let token = CompletionToken::new(kind, move || {
            state.complete();
            if tx.send(Event::Complete).is_err() {
                tracing::warn!(%kind, "deferred run dropped before completion");
            }
        });
        info!(%kind, "starting deferred test");
        self.launch(raw, token)?;
        Ok(Deferred::new(
            kind,
            rx,
            self.log.clone(),
            self.entry.clone(),
            self.handle.liveness(),
        ))
    }

    fn launch(&self, raw: RawHandle, token: Arc<CompletionToken>) -> Result<()> {
        let fire = token.clone();
        let launched = self.lib().run_async(
            raw,
            Box::new(move || {
                fire.fire();
            }),
        );
        if launched.is_err() {
            self.state.complete();
        }
        launched
    }

    /// Request destruction of the native handle. Idempotent; safe while a
    /// run is in flight. Every later operation fails with
    /// `UseAfterDestroy`.
    pub fn destroy(&mut self) {
        self.handle.destroy();
    }
}

impl std::fmt::Debug for NetTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetTest")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

/// Options each kind starts with. Plain data: they are set like any other
/// option and can be overwritten.
pub fn preset_options(kind: TestKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        TestKind::DnsInjection => &[("backend", "8.8.8.1:53")],
        TestKind::HttpInvalidRequestLine => &[("backend", "http://213.138.109.232/")],
        TestKind::TcpConnect => &[("port", "80")],
        TestKind::WebConnectivity => &[("nameserver", "8.8.8.8:53")],
        TestKind::DnsQuery => &[
            ("dns/type", "A"),
            ("dns/class", "IN"),
            ("dns/nameserver", "8.8.8.8"),
        ],
        TestKind::Ndt | TestKind::MeekFrontedRequests | TestKind::HttpRequest => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::loopback::LoopbackLibrary;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn new_test(kind: TestKind) -> NetTest {
        NetTest::create(Arc::new(LoopbackLibrary::new()), kind).unwrap()
    }

    #[test]
    fn test_option_set_last_write_wins() {
        let mut opts = OptionSet::default();
        assert_eq!(opts.insert("a", "1"), None);
        opts.insert("b", "2");
        assert_eq!(opts.insert("a", "3"), Some("1".to_string()));
        assert_eq!(opts.get("a"), Some("3"));
        assert_eq!(opts.len(), 2);
        let keys: Vec<_> = opts.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_setters_chain_and_mirror_config() {
        let mut test = new_test(TestKind::TcpConnect);
        test.set_option("port", "80")
            .unwrap()
            .set_input_path("hosts.txt")
            .unwrap()
            .set_output_path("report.jsonl")
            .unwrap()
            .set_verbosity(Verbosity::INFO)
            .unwrap()
            .increase_verbosity()
            .unwrap();

        let cfg = test.config();
        assert_eq!(cfg.options.get("port"), Some("80"));
        assert_eq!(cfg.input_path.as_deref(), Some(Path::new("hosts.txt")));
        assert_eq!(cfg.output_path.as_deref(), Some(Path::new("report.jsonl")));
        assert_eq!(cfg.verbosity, Verbosity::DEBUG);
        assert_eq!(test.state(), RunState::Configured);
    }

    #[test]
    fn test_use_after_destroy_rejected_locally() {
        let mut test = new_test(TestKind::Ndt);
        test.destroy();
        assert!(test.is_destroyed());
        assert_eq!(
            test.set_option("k", "v").unwrap_err(),
            BridgeError::UseAfterDestroy
        );
        assert_eq!(test.run().unwrap_err(), BridgeError::UseAfterDestroy);
        assert_eq!(
            test.on_log(|_, _| {}).unwrap_err(),
            BridgeError::UseAfterDestroy
        );
        assert!(test.config().options.is_empty());
        test.destroy();
    }

    #[test]
    fn test_blocking_run_completes_and_cannot_rerun() {
        let mut test = new_test(TestKind::Ndt);
        let entries = Arc::new(Mutex::new(Vec::new()));
        let sink = entries.clone();
        test.on_entry(move |e| sink.lock().unwrap().push(e.to_string()))
            .unwrap();
        test.run().unwrap();
        assert_eq!(test.state(), RunState::Completed);
        assert_eq!(entries.lock().unwrap().len(), 1);

        assert_eq!(test.run().unwrap_err(), BridgeError::AlreadyStarted);
        assert_eq!(
            test.set_option("late", "1").unwrap_err(),
            BridgeError::AlreadyStarted
        );
    }

    #[test]
    fn test_run_async_fires_once() {
        let mut test = new_test(TestKind::HttpRequest);
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std::sync::mpsc::channel();
        let c = count.clone();
        test.run_async(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(test.state(), RunState::Completed);
    }

    #[test]
    fn test_presets_match_kind_defaults() {
        assert_eq!(preset_options(TestKind::TcpConnect), &[("port", "80")]);
        assert!(preset_options(TestKind::Ndt).is_empty());
        assert_eq!(preset_options(TestKind::DnsQuery).len(), 3);
    }

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), RunState::Configured);
        cell.start().unwrap();
        assert_eq!(cell.get(), RunState::Running);
        assert_eq!(cell.start(), Err(BridgeError::AlreadyStarted));
        cell.complete();
        assert_eq!(cell.get(), RunState::Completed);
        assert_eq!(cell.start(), Err(BridgeError::AlreadyStarted));
        assert_eq!(cell.0.load(Ordering::Acquire), COMPLETED);
    }
}
