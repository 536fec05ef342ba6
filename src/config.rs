//! TOML configuration for the bridge.
//!
//! Layered the usual way: an explicit path, then the `MKBRIDGE_CONFIG`
//! environment variable, then `./mkbridge.toml`, then compiled-in
//! defaults.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::version::EXPECTED_LIBRARY_MAJOR;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub binding: BindingConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded bridge configuration");
        Ok(config)
    }

    /// Try `MKBRIDGE_CONFIG`, then `./mkbridge.toml`, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("MKBRIDGE_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "MKBRIDGE_CONFIG points at an unusable file, falling back to ./mkbridge.toml"
                    );
                }
            }
        }

        let local_path = Path::new("mkbridge.toml");
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "ignoring unreadable mkbridge.toml in working directory"
                    );
                }
            }
        }

        debug!("no mkbridge.toml found, running with built-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Major version the loaded native library must report.
    pub expected_major_version: String,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            expected_major_version: EXPECTED_LIBRARY_MAJOR.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults applied to every new test
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Initial native verbosity level (0 = warning .. 3 = debug2).
    pub verbosity: u32,
    /// Request JSON-formatted native log lines.
    pub json_log: bool,
    /// Options set on every test before any user option.
    pub options: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit tracing output as JSON lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.binding.expected_major_version, "1");
        assert_eq!(cfg.defaults.verbosity, 0);
        assert!(!cfg.defaults.json_log);
        assert!(cfg.defaults.options.is_empty());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[binding]
expected_major_version = "0"

[defaults]
verbosity = 2
json_log = true

[defaults.options]
nameserver = "8.8.8.8:53"
no_collector = "1"

[logging]
level = "debug"
json = true
"#;
        let cfg: BridgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.binding.expected_major_version, "0");
        assert_eq!(cfg.defaults.verbosity, 2);
        assert!(cfg.defaults.json_log);
        assert_eq!(cfg.defaults.options.len(), 2);
        assert_eq!(cfg.defaults.options["nameserver"], "8.8.8.8:53");
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: BridgeConfig = toml::from_str("[logging]\nlevel = \"warn\"\n").unwrap();
        assert_eq!(cfg.logging.level, "warn");
        assert_eq!(cfg.binding.expected_major_version, "1");
        assert!(cfg.defaults.options.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mkbridge.toml");
        std::fs::write(&path, "[defaults]\nverbosity = 1\n").unwrap();

        let cfg = BridgeConfig::load(&path).unwrap();
        assert_eq!(cfg.defaults.verbosity, 1);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(BridgeConfig::load(Path::new("/nonexistent/mkbridge.toml")).is_err());
    }

    #[test]
    fn test_unusable_env_config_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[defaults\nverbosity = ").unwrap();

        std::env::set_var("MKBRIDGE_CONFIG", &path);
        let cfg = BridgeConfig::load_or_default();
        std::env::remove_var("MKBRIDGE_CONFIG");

        assert_eq!(cfg.defaults.verbosity, 0);
        assert_eq!(cfg.binding.expected_major_version, "1");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut cfg = BridgeConfig::default();
        cfg.defaults.options.insert("port".into(), "80".into());
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: BridgeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.defaults.options["port"], "80");
        assert_eq!(back.logging.level, cfg.logging.level);
    }
}
