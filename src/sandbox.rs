//! Sandbox controller interface.
//!
//! A backend owns the isolated environments; callers only ever hold an
//! opaque [`SandboxHandle`]. The registry talks to backends exclusively
//! through [`SandboxBackend`], so the namespace implementation and the
//! in-memory test doubles are interchangeable.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::sanitize::Framing;

/// Resource ceilings applied to every sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    /// Hard memory ceiling. Swap is capped to match (no extra swap).
    pub memory_bytes: u64,
    /// CPU share in whole CPUs, e.g. `0.5` for half a core.
    pub cpu_quota: f64,
    /// Concurrently running processes allowed inside the sandbox.
    pub max_pids: u64,
    /// CPU time before the kernel kills the program.
    pub cpu_time_secs: u64,
    pub fsize_kb: u64,
    pub nofile: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            cpu_quota: 0.5,
            max_pids: 64,
            cpu_time_secs: 30,
            fsize_kb: 10240,
            nofile: 64,
        }
    }
}

/// Opaque reference to one sandbox. Never shared across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle {
    id: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Both streams on one multiplexed channel.
    Combined,
}

/// Raw bytes as read from the sandbox, before sanitizing.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

/// The read half of an attached sandbox. Chunks arrive in channel order;
/// the channel closes once the program has closed all of its output.
#[derive(Debug)]
pub struct SandboxChannel {
    pub output: mpsc::Receiver<std::io::Result<OutputChunk>>,
    pub framing: Framing,
}

/// Liveness as reported by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub running: bool,
    pub exit_code: Option<i32>,
}

impl SandboxStatus {
    pub fn running() -> Self {
        Self { running: true, exit_code: None }
    }

    pub fn exited(code: i32) -> Self {
        Self { running: false, exit_code: Some(code) }
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Create and start a sandbox running `source`. On failure nothing is
    /// left behind.
    async fn create(&self, source: &str) -> Result<SandboxHandle>;

    /// Attach to the sandbox's output. Can only succeed once per sandbox.
    async fn attach(&self, handle: &SandboxHandle) -> Result<SandboxChannel>;

    /// Write one line of input. Implementations terminate it with
    /// [`input_line`].
    async fn write_input(&self, handle: &SandboxHandle, text: &str) -> Result<()>;

    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxStatus>;

    /// Stop and remove the sandbox. Safe to call on a sandbox that has
    /// already exited or been destroyed.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<()>;
}

/// Line-buffered input as the program expects to read it.
pub fn input_line(text: &str) -> String {
    format!("{text}\n")
}
