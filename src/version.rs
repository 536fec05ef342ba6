//! Version compatibility between the bindings and the native library.

use crate::error::{BridgeError, Result};

/// Version of these bindings, appended to the library version.
pub const BINDINGS_VERSION: &str = "1";

/// Major version of the native interface the bindings were built against.
pub const EXPECTED_LIBRARY_MAJOR: &str = "1";

/// Fail unless `found` has major component `expected_major`.
pub fn check_compatible(found: &str, expected_major: &str) -> Result<()> {
    let major = found
        .trim()
        .trim_start_matches('v')
        .split(['.', '-'])
        .next()
        .unwrap_or_default();
    if major.is_empty() || major != expected_major.trim() {
        return Err(BridgeError::VersionMismatch {
            expected: expected_major.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}
