//! Error taxonomy for the bridge.
//!
//! Configuration and lifecycle errors surface synchronously from the
//! offending call. Native-side test failures are not errors here: they
//! arrive as ordinary entry content.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("unknown test kind '{name}'")]
    UnknownTestKind { name: String },

    #[error("native library version {found} does not match expected major version {expected}")]
    VersionMismatch { expected: String, found: String },

    #[error("malformed entry: {reason}")]
    MalformedEntry { reason: String, raw: String },

    #[error("test handle used after destroy")]
    UseAfterDestroy,

    #[error("test has already been started")]
    AlreadyStarted,

    #[error("run ended without a completion signal")]
    RunAbandoned,

    #[error("native library refused {op}: {reason}")]
    Native { op: &'static str, reason: String },
}

impl BridgeError {
    pub(crate) fn native(op: &'static str, reason: impl Into<String>) -> Self {
        BridgeError::Native {
            op,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let e = BridgeError::UnknownTestKind {
            name: "bogus_kind".into(),
        };
        assert_eq!(e.to_string(), "unknown test kind 'bogus_kind'");

        let e = BridgeError::VersionMismatch {
            expected: "1".into(),
            found: "0.2.0".into(),
        };
        assert!(e.to_string().contains("0.2.0"));
        assert!(e.to_string().contains("major version 1"));
    }

    #[test]
    fn test_native_helper() {
        let e = BridgeError::native("set_option", "no such handle");
        assert_eq!(
            e,
            BridgeError::Native {
                op: "set_option",
                reason: "no such handle".into()
            }
        );
    }
}
