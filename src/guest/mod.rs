//! Reference guest runtime.
//!
//! Speaks the guest side of the bridge: connects back to the host, runs the
//! handshake and serves `ExtHostExtensionService`, `ExtHostCommands` and
//! `ExtHostConfiguration`. Used by the `exthost-guest` binary and as the
//! stub guest in end-to-end tests.

pub mod runtime;
pub mod services;

pub use runtime::{GuestExit, GuestOptions, GuestRuntime};
pub use services::{
    GuestCommands, GuestConfiguration, GuestExtensionHost, HostApi, BUILTIN_COMMANDS,
    GUEST_LOG_TARGET,
};
