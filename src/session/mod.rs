//! Session orchestration.
//!
//! `NotStarted → ProcessLaunching → AwaitingReady → AwaitingInitialized →
//! Active → Disposing → Disposed`, with the one-byte handshake in
//! `handshake` and the owning [`ExtensionHostSession`] in `orchestrator`.

pub mod handshake;
pub mod orchestrator;
pub mod state;

pub use handshake::{EnvironmentInfo, HandshakeMessage, InitPayload, WorkspaceInfo};
pub use orchestrator::ExtensionHostSession;
pub use state::{SessionState, StateCell};
