//! The native boundary.
//!
//! [`NativeLibrary`] is the full surface the bridge consumes from the
//! library that actually executes measurement tests. Handles are opaque
//! and only ever passed back. Hooks registered here are invoked on threads
//! the library owns.
//!
//! Contract the implementations must honour:
//! - `destroy` is legal while a run is in flight; physical cleanup may be
//!   deferred until the library's own work drains.
//! - after `destroy` returns, log and entry hooks for that handle are
//!   never invoked again.
//! - the completion hook passed to `run_async` is invoked at most once,
//!   after every log and entry of the run.

pub mod loopback;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;

/// Opaque reference to native-side test state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

impl std::fmt::Display for RawHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub type LogHook = Arc<dyn Fn(u32, &str) + Send + Sync>;
pub type EntryHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type CompleteHook = Box<dyn FnOnce() + Send>;

pub trait NativeLibrary: Send + Sync {
    /// Version string the loaded library reports about itself.
    fn library_version(&self) -> String;

    /// Create a test by its native name.
    fn create(&self, name: &str) -> Result<RawHandle>;

    fn destroy(&self, handle: RawHandle);

    fn set_option(&self, handle: RawHandle, key: &str, value: &str) -> Result<()>;

    fn set_input_path(&self, handle: RawHandle, path: &Path) -> Result<()>;

    fn set_output_path(&self, handle: RawHandle, path: &Path) -> Result<()>;

    fn set_verbosity(&self, handle: RawHandle, verbosity: u32) -> Result<()>;

    fn increase_verbosity(&self, handle: RawHandle) -> Result<()>;

    fn on_log(&self, handle: RawHandle, hook: LogHook) -> Result<()>;

    fn on_entry(&self, handle: RawHandle, hook: EntryHook) -> Result<()>;

    /// Run to completion, blocking the calling thread.
    fn run(&self, handle: RawHandle) -> Result<()>;

    /// Start the run and return immediately.
    fn run_async(&self, handle: RawHandle, on_complete: CompleteHook) -> Result<()>;
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
