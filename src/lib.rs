//! mkbridge -- asynchronous bridge to a native network-measurement library.
//!
//! A [`Binding`] checks the native library version once, then creates
//! [`NetTest`]s. Each test owns one native handle, accumulates
//! configuration through chained setters, and runs in one of three modes:
//! blocking ([`NetTest::run`]), callback ([`NetTest::run_async`]) or
//! future ([`NetTest::run_deferred`]). Native notifications arrive on
//! library-owned threads; the [`adapter`] moves them to where the consumer
//! expects them.

pub mod adapter;
pub mod binding;
pub mod builder;
pub mod config;
pub mod error;
pub mod handle;
pub mod kind;
pub mod native;
pub mod telemetry;
pub mod verbosity;
pub mod version;

pub use adapter::{decode_entry, CompletionToken, Deferred, Event, RunOutcome};
pub use binding::Binding;
pub use builder::{NetTest, OptionSet, RunState, TestConfig};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use kind::TestKind;
pub use native::loopback::LoopbackLibrary;
pub use native::{NativeLibrary, RawHandle};
pub use verbosity::Verbosity;
