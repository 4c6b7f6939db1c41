#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod extensions;
pub mod guest;
pub mod protocol;
pub mod rpc;
pub mod services;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, RemoteError, RemoteErrorKind, Result};
