//! Single-owner wrapper around a native test handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::kind::TestKind;
use crate::native::{NativeLibrary, RawHandle};

/// Shared validity flag for a handle.
///
/// Deliveries scheduled before destruction check it before calling
/// consumer code.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Liveness(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns exactly one native handle and destroys it exactly once, either
/// through [`TestHandle::destroy`] or on drop.
pub struct TestHandle {
    lib: Arc<dyn NativeLibrary>,
    raw: Option<RawHandle>,
    kind: TestKind,
    alive: Liveness,
}

impl TestHandle {
    pub fn create(lib: Arc<dyn NativeLibrary>, kind: TestKind) -> Result<Self> {
        let raw = lib.create(kind.native_name())?;
        debug!(%kind, handle = %raw, "created native test handle");
        Ok(Self {
            lib,
            raw: Some(raw),
            kind,
            alive: Liveness::new(),
        })
    }

    /// The raw handle, or `UseAfterDestroy` once destruction was requested.
    pub fn raw(&self) -> Result<RawHandle> {
        self.raw.ok_or(BridgeError::UseAfterDestroy)
    }

    pub fn kind(&self) -> TestKind {
        self.kind
    }

    pub fn library(&self) -> &Arc<dyn NativeLibrary> {
        &self.lib
    }

    pub fn liveness(&self) -> Liveness {
        self.alive.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.raw.is_none()
    }

    pub fn destroy(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.alive.revoke();
            self.lib.destroy(raw);
            debug!(kind = %self.kind, handle = %raw, "destroyed native test handle");
        }
    }
}

impl Drop for TestHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for TestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHandle")
            .field("kind", &self.kind)
            .field("raw", &self.raw)
            .finish()
    }
}
