//! In-process implementation of the native boundary.
//!
//! Each run executes on a dedicated worker thread owned by the library.
//! The worker reads the input file line by line and emits one entry per
//! input echoing the test configuration; it does not measure anything.
//! Destroyed handles are unlinked immediately while a running worker keeps
//! its own reference until it drains, so destroy-during-run is safe.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{lock, CompleteHook, EntryHook, LogHook, NativeLibrary, RawHandle};
use crate::error::{BridgeError, Result};
use crate::kind::TestKind;
use crate::verbosity::{Verbosity, LOG_DEBUG, LOG_DEBUG2, LOG_INFO, LOG_WARNING};

pub const LOOPBACK_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Default)]
struct Settings {
    options: Vec<(String, String)>,
    input_path: Option<PathBuf>,
    output_path: Option<PathBuf>,
    verbosity: Verbosity,
}

struct LoopbackTest {
    id: u64,
    kind: TestKind,
    settings: Mutex<Settings>,
    log_hook: Mutex<Option<LogHook>>,
    entry_hook: Mutex<Option<EntryHook>>,
    detached: AtomicBool,
    started: AtomicBool,
}

impl LoopbackTest {
    fn log(&self, severity: u32, message: &str) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        let verbosity = lock(&self.settings).verbosity;
        if !verbosity.admits(severity) {
            return;
        }
        let Some(hook) = lock(&self.log_hook).clone() else {
            return;
        };
        if verbosity.is_json() {
            let line = json!({ "severity": severity, "message": message }).to_string();
            hook(severity, &line);
        } else {
            hook(severity, message);
        }
    }

    fn emit_entry(&self, raw: &str) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        if let Some(hook) = lock(&self.entry_hook).clone() {
            hook(raw);
        }
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        lock(&self.log_hook).take();
        lock(&self.entry_hook).take();
    }
}

/// Loopback native library.
pub struct LoopbackLibrary {
    version: String,
    step_delay: Duration,
    next_id: AtomicU64,
    tests: Mutex<HashMap<u64, Arc<LoopbackTest>>>,
}

impl Default for LoopbackLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackLibrary {
    pub fn new() -> Self {
        Self {
            version: LOOPBACK_VERSION.to_string(),
            step_delay: Duration::ZERO,
            next_id: AtomicU64::new(1),
            tests: Mutex::new(HashMap::new()),
        }
    }

    /// Report a different library version (for exercising the version guard).
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Pause before each input is processed.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Number of handles that have been created and not yet destroyed.
    pub fn live_handles(&self) -> usize {
        lock(&self.tests).len()
    }

    fn get(&self, handle: RawHandle, op: &'static str) -> Result<Arc<LoopbackTest>> {
        lock(&self.tests)
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| BridgeError::native(op, format!("no such handle {}", handle)))
    }

    fn configure(
        &self,
        handle: RawHandle,
        op: &'static str,
        f: impl FnOnce(&mut Settings),
    ) -> Result<()> {
        let test = self.get(handle, op)?;
        if test.started.load(Ordering::Acquire) {
            return Err(BridgeError::native(op, "test already started"));
        }
        f(&mut lock(&test.settings));
        Ok(())
    }
}

impl NativeLibrary for LoopbackLibrary {
    fn library_version(&self) -> String {
        self.version.clone()
    }

    fn create(&self, name: &str) -> Result<RawHandle> {
        let kind: TestKind = name.parse()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let test = Arc::new(LoopbackTest {
            id,
            kind,
            settings: Mutex::new(Settings::default()),
            log_hook: Mutex::new(None),
            entry_hook: Mutex::new(None),
            detached: AtomicBool::new(false),
            started: AtomicBool::new(false),
        });
        lock(&self.tests).insert(id, test);
        debug!(id, %kind, "loopback: created test");
        Ok(RawHandle(id))
    }

    fn destroy(&self, handle: RawHandle) {
        match lock(&self.tests).remove(&handle.0) {
            Some(test) => {
                test.detach();
                debug!(id = handle.0, "loopback: destroyed test");
            }
            None => warn!(id = handle.0, "loopback: destroy of unknown handle ignored"),
        }
    }

    fn set_option(&self, handle: RawHandle, key: &str, value: &str) -> Result<()> {
        self.configure(handle, "set_option", |s| {
            match s.options.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.to_string(),
                None => s.options.push((key.to_string(), value.to_string())),
            }
        })
    }

    fn set_input_path(&self, handle: RawHandle, path: &Path) -> Result<()> {
        self.configure(handle, "set_input_path", |s| {
            s.input_path = Some(path.to_path_buf())
        })
    }

    fn set_output_path(&self, handle: RawHandle, path: &Path) -> Result<()> {
        self.configure(handle, "set_output_path", |s| {
            s.output_path = Some(path.to_path_buf())
        })
    }

    fn set_verbosity(&self, handle: RawHandle, verbosity: u32) -> Result<()> {
        self.configure(handle, "set_verbosity", |s| {
            s.verbosity = Verbosity::from_bits(verbosity)
        })
    }

    fn increase_verbosity(&self, handle: RawHandle) -> Result<()> {
        self.configure(handle, "increase_verbosity", |s| {
            s.verbosity = s.verbosity.increased()
        })
    }

    fn on_log(&self, handle: RawHandle, hook: LogHook) -> Result<()> {
        let test = self.get(handle, "on_log")?;
        *lock(&test.log_hook) = Some(hook);
        Ok(())
    }

    fn on_entry(&self, handle: RawHandle, hook: EntryHook) -> Result<()> {
        let test = self.get(handle, "on_entry")?;
        *lock(&test.entry_hook) = Some(hook);
        Ok(())
    }

    fn run(&self, handle: RawHandle) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.run_async(
            handle,
            Box::new(move || {
                let _ = tx.send(());
            }),
        )?;
        rx.recv()
            .map_err(|_| BridgeError::native("run", "worker exited without completing"))
    }

    fn run_async(&self, handle: RawHandle, on_complete: CompleteHook) -> Result<()> {
        let test = self.get(handle, "run_async")?;
        if test.started.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::native("run_async", "already running"));
        }
        let delay = self.step_delay;
        std::thread::Builder::new()
            .name(format!("loopback-{}", test.id))
            .spawn(move || {
                execute(&test, delay);
                // The run is over: entries can no longer be produced.
                lock(&test.entry_hook).take();
                on_complete();
            })
            .map_err(|e| BridgeError::native("run_async", e.to_string()))?;
        Ok(())
    }
}

fn read_inputs(test: &LoopbackTest, path: Option<&Path>) -> Vec<String> {
    let Some(path) = path else {
        return vec![String::new()];
    };
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(String::from)
            .collect(),
        Err(e) => {
            test.log(
                LOG_WARNING,
                &format!("cannot read input file {}: {}", path.display(), e),
            );
            Vec::new()
        }
    }
}

fn execute(test: &LoopbackTest, delay: Duration) {
    let settings = lock(&test.settings).clone();
    let report_id = Uuid::new_v4().to_string();
    let started = Instant::now();

    test.log(LOG_INFO, &format!("{}: test starting", test.kind));
    for (key, value) in &settings.options {
        test.log(LOG_DEBUG, &format!("option {} = {}", key, value));
    }

    let inputs = read_inputs(test, settings.input_path.as_deref());
    let mut report = settings.output_path.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                test.log(
                    LOG_WARNING,
                    &format!("cannot open output file {}: {}", path.display(), e),
                );
                None
            }
        }
    });

    let options: serde_json::Map<String, serde_json::Value> = settings
        .options
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();

    for input in &inputs {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        test.log(LOG_DEBUG2, &format!("processing input '{}'", input));
        let entry = json!({
            "test_name": test.kind.native_name(),
            "input": input,
            "options": options,
            "report_id": report_id,
            "measurement_start_time": Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "test_runtime": started.elapsed().as_secs_f64(),
            "test_keys": {},
        });
        let raw = entry.to_string();
        if let Some(file) = report.as_mut() {
            if let Err(e) = writeln!(file, "{}", raw) {
                test.log(LOG_WARNING, &format!("cannot write report entry: {}", e));
            }
        }
        test.emit_entry(&raw);
    }

    test.log(
        LOG_INFO,
        &format!("{}: test complete ({} entries)", test.kind, inputs.len()),
    );
}
