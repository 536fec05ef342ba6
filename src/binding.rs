//! Entry point: a version-checked session over one native library.

use std::sync::Arc;

use tracing::{debug, info};

use crate::builder::{preset_options, NetTest};
use crate::config::{BridgeConfig, DefaultsConfig};
use crate::error::Result;
use crate::kind::TestKind;
use crate::native::NativeLibrary;
use crate::version::{check_compatible, BINDINGS_VERSION, EXPECTED_LIBRARY_MAJOR};
use crate::verbosity::Verbosity;

/// A loaded native library whose version has been checked.
///
/// Every test is created through a `Binding`, so no handle can exist
/// before the compatibility check has passed.
#[derive(Clone)]
pub struct Binding {
    lib: Arc<dyn NativeLibrary>,
    library_version: String,
    defaults: DefaultsConfig,
}

impl Binding {
    /// Load with the compiled-in expected major version and no defaults.
    pub fn load(lib: Arc<dyn NativeLibrary>) -> Result<Self> {
        Self::load_expecting(lib, EXPECTED_LIBRARY_MAJOR, DefaultsConfig::default())
    }

    pub fn with_config(lib: Arc<dyn NativeLibrary>, config: &BridgeConfig) -> Result<Self> {
        Self::load_expecting(
            lib,
            &config.binding.expected_major_version,
            config.defaults.clone(),
        )
    }

    fn load_expecting(
        lib: Arc<dyn NativeLibrary>,
        expected_major: &str,
        defaults: DefaultsConfig,
    ) -> Result<Self> {
        let library_version = lib.library_version();
        check_compatible(&library_version, expected_major)?;
        info!(%library_version, bindings = BINDINGS_VERSION, "native library loaded");
        Ok(Self {
            lib,
            library_version,
            defaults,
        })
    }

    pub fn library_version(&self) -> &str {
        &self.library_version
    }

    /// Combined `<library>-<bindings>` version string.
    pub fn version(&self) -> String {
        format!("{}-{}", self.library_version, BINDINGS_VERSION)
    }

    /// Create a test with the configured defaults applied.
    pub fn create(&self, kind: TestKind) -> Result<NetTest> {
        let mut test = NetTest::create(self.lib.clone(), kind)?;
        let verbosity =
            Verbosity::from_bits(self.defaults.verbosity).with_json(self.defaults.json_log);
        if verbosity != Verbosity::default() {
            test.set_verbosity(verbosity)?;
        }
        for (key, value) in &self.defaults.options {
            test.set_option(key.as_str(), value.as_str())?;
        }
        debug!(%kind, defaults = self.defaults.options.len(), "test created");
        Ok(test)
    }

    /// Create a test from its native or kebab-case name.
    pub fn create_named(&self, name: &str) -> Result<NetTest> {
        self.create(name.parse()?)
    }

    /// Create a test pre-populated with the kind's preset options.
    pub fn preset(&self, kind: TestKind) -> Result<NetTest> {
        let mut test = self.create(kind)?;
        for (key, value) in preset_options(kind) {
            test.set_option(*key, *value)?;
        }
        Ok(test)
    }

    pub fn dns_injection(&self) -> Result<NetTest> {
        self.preset(TestKind::DnsInjection)
    }

    pub fn http_invalid_request_line(&self) -> Result<NetTest> {
        self.preset(TestKind::HttpInvalidRequestLine)
    }

    pub fn ndt(&self) -> Result<NetTest> {
        self.preset(TestKind::Ndt)
    }

    pub fn tcp_connect(&self) -> Result<NetTest> {
        self.preset(TestKind::TcpConnect)
    }

    pub fn web_connectivity(&self) -> Result<NetTest> {
        self.preset(TestKind::WebConnectivity)
    }

    pub fn meek_fronted_requests(&self) -> Result<NetTest> {
        self.preset(TestKind::MeekFrontedRequests)
    }

    pub fn dns_query(&self) -> Result<NetTest> {
        self.preset(TestKind::DnsQuery)
    }

    pub fn http_request(&self) -> Result<NetTest> {
        self.preset(TestKind::HttpRequest)
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("library_version", &self.library_version)
            .finish()
    }
}
