//! Guest runtime process supervision.
//!
//! - `runtime`: executable lookup and minimum-version enforcement.
//! - `env`: the environment contract between host and guest.
//! - `process`: [`ProcessSupervisor`], launch, exit monitoring and stop.

pub mod env;
pub mod process;
pub mod runtime;

pub use env::{build_child_env, connection_target_from_env, inherited_env};
pub use process::{ProcessState, ProcessSupervisor, SupervisorConfig};
pub use runtime::{find_on_path, resolve_runtime, ResolvedRuntime, Version};
