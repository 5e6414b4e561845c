//! Sandterm - interactive programs in Linux sandboxes, driven one
//! request/response turn at a time.
//!
//! A run starts a sandboxed Python program and returns whatever it printed
//! until it exits, asks for input, goes quiet or runs out of time. Later
//! requests feed it lines of input or poll for more output. Sessions live
//! for a fixed time from creation and are torn down exactly once.

pub mod cgroup;
pub mod config;
pub mod error;
pub mod http_server;
#[cfg(target_os = "linux")]
pub mod namespace;
pub mod orchestrator;
pub mod prompt;
pub mod registry;
pub mod sandbox;
pub mod sanitize;
pub mod session;
pub mod state;
pub mod waiter;

pub use error::{Result, SessionError};
pub use orchestrator::{InputRequest, Orchestrator, PollRequest, RunRequest, RunResponse};
pub use registry::{RegistryConfig, SessionRegistry};
pub use sandbox::{SandboxBackend, SandboxChannel, SandboxHandle, SandboxLimits, SandboxStatus};
pub use session::{SessionId, SessionState};
pub use state::AppState;
pub use waiter::WaitOptions;
