//! Log verbosity as understood by the native library.
//!
//! The low bits carry an ordered severity level, bit 5 independently
//! requests JSON-formatted log lines.

use serde::{Deserialize, Serialize};

pub const LOG_WARNING: u32 = 0;
pub const LOG_INFO: u32 = 1;
pub const LOG_DEBUG: u32 = 2;
pub const LOG_DEBUG2: u32 = 3;
pub const LOG_VERBOSITY_MASK: u32 = 31;
pub const LOG_JSON: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Verbosity(u32);

impl Verbosity {
    pub const WARNING: Verbosity = Verbosity(LOG_WARNING);
    pub const INFO: Verbosity = Verbosity(LOG_INFO);
    pub const DEBUG: Verbosity = Verbosity(LOG_DEBUG);
    pub const DEBUG2: Verbosity = Verbosity(LOG_DEBUG2);

    pub fn from_bits(bits: u32) -> Self {
        Verbosity(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn level(&self) -> u32 {
        self.0 & LOG_VERBOSITY_MASK
    }

    pub fn is_json(&self) -> bool {
        self.0 & LOG_JSON != 0
    }

    pub fn with_json(self, json: bool) -> Self {
        if json {
            Verbosity(self.0 | LOG_JSON)
        } else {
            Verbosity(self.0 & !LOG_JSON)
        }
    }

    /// One step more verbose. Saturates at the mask and keeps flag bits.
    pub fn increased(self) -> Self {
        let level = (self.level() + 1).min(LOG_VERBOSITY_MASK);
        Verbosity((self.0 & !LOG_VERBOSITY_MASK) | level)
    }

    /// Whether a line of `severity` passes this verbosity.
    pub fn admits(&self, severity: u32) -> bool {
        (severity & LOG_VERBOSITY_MASK) <= self.level()
    }
}

/// Map a native severity onto a tracing level.
pub fn tracing_level(severity: u32) -> tracing::Level {
    match severity & LOG_VERBOSITY_MASK {
        LOG_WARNING => tracing::Level::WARN,
        LOG_INFO => tracing::Level::INFO,
        LOG_DEBUG => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(Verbosity::WARNING.level() < Verbosity::INFO.level());
        assert!(Verbosity::INFO.level() < Verbosity::DEBUG.level());
        assert!(Verbosity::DEBUG.level() < Verbosity::DEBUG2.level());
    }

    #[test]
    fn test_json_flag_does_not_affect_level() {
        let v = Verbosity::DEBUG.with_json(true);
        assert!(v.is_json());
        assert_eq!(v.level(), LOG_DEBUG);
        assert_eq!(v.bits(), LOG_DEBUG | LOG_JSON);
        assert_eq!(v.with_json(false), Verbosity::DEBUG);
    }

    #[test]
    fn test_increase_keeps_flag_and_saturates() {
        let v = Verbosity::INFO.with_json(true).increased();
        assert_eq!(v.level(), LOG_DEBUG);
        assert!(v.is_json());

        let top = Verbosity::from_bits(LOG_VERBOSITY_MASK).increased();
        assert_eq!(top.level(), LOG_VERBOSITY_MASK);
    }

    #[test]
    fn test_admits() {
        assert!(Verbosity::INFO.admits(LOG_WARNING));
        assert!(Verbosity::INFO.admits(LOG_INFO));
        assert!(!Verbosity::INFO.admits(LOG_DEBUG));
        assert!(Verbosity::WARNING.with_json(true).admits(LOG_WARNING));
    }

    #[test]
    fn test_tracing_level_mapping() {
        assert_eq!(tracing_level(LOG_WARNING), tracing::Level::WARN);
        assert_eq!(tracing_level(LOG_DEBUG2), tracing::Level::TRACE);
    }
}
