//! Error taxonomy for sandbox sessions.

use thiserror::Error;

/// Everything that can go wrong between a request arriving and a response
/// leaving, plus the teardown failures backends report to the registry.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The sandbox could not be created or started. No session was registered.
    #[error("failed to create sandbox: {0}")]
    Creation(String),

    /// The sandbox was created but its channel could not be attached.
    #[error("failed to attach to sandbox: {0}")]
    Attach(String),

    /// The channel failed mid-session. The session has been torn down.
    #[error("sandbox stream failed, please run the program again: {0}")]
    Stream(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} has expired")]
    Expired(String),

    /// The orchestrator's own call budget ran out. The session stays alive.
    #[error("no response within {budget_ms} ms, the session is still alive and can be polled")]
    CallerTimeout { budget_ms: u64 },

    /// The program exited with a nonzero status.
    #[error("program exited with code {exit_code}")]
    Execution { exit_code: i32, output: String },

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Reported by backends when stopping a sandbox goes wrong. Logged by
    /// the registry, never returned to a caller.
    #[error("sandbox teardown failed: {0}")]
    Teardown(String),
}

impl SessionError {
    /// Stable machine-readable name for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Creation(_) => "creation_error",
            SessionError::Attach(_) => "attach_error",
            SessionError::Stream(_) => "stream_error",
            SessionError::NotFound(_) => "session_not_found",
            SessionError::Expired(_) => "session_expired",
            SessionError::CallerTimeout { .. } => "timeout",
            SessionError::Execution { .. } => "execution_error",
            SessionError::UnsupportedLanguage(_) => "unsupported_language",
            SessionError::InvalidRequest(_) => "invalid_request",
            SessionError::Teardown(_) => "teardown_error",
        }
    }

    /// Whether the caller can retry or poll the same session rather than
    /// starting a new run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::CallerTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
