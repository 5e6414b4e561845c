//! Per-session state: lifecycle, output history and the attached channel.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::sandbox::{SandboxChannel, SandboxHandle};

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Creating,
    AwaitingOutput,
    AwaitingInput,
    Processing,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Expired | SessionState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal move. Staying in a non-terminal
    /// state is allowed where a turn can end without new information.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Expired | Cancelled) => true,
            (Creating, AwaitingOutput | Failed) => true,
            (AwaitingOutput, AwaitingOutput | AwaitingInput | Processing | Completed | Failed) => true,
            (AwaitingInput, AwaitingInput | AwaitingOutput | Processing | Completed | Failed) => true,
            (Processing, Processing | AwaitingInput | Completed | Failed) => true,
            _ => false,
        }
    }
}

/// Append-only transcript of everything the program printed, plus echoed
/// input lines.
#[derive(Debug, Default, Clone)]
pub struct OutputHistory {
    entries: Vec<String>,
}

impl OutputHistory {
    pub fn push(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.entries.push(text);
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn text(&self) -> String {
        self.entries.concat()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mutable part of a session. Only reachable through [`Session::lock`], so
/// all mutation of one session is serialized.
#[derive(Debug)]
pub struct SessionInner {
    state: SessionState,
    pub history: OutputHistory,
    pub channel: SandboxChannel,
    /// Prompt of the pending read while in `AwaitingInput`.
    pub last_prompt: Option<String>,
    pub last_activity_at: Instant,
}

impl SessionInner {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Illegal moves are logged and ignored.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "ignoring illegal session transition");
            return false;
        }
        debug!(from = ?self.state, to = ?next, "session transition");
        self.state = next;
        true
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    handle: SandboxHandle,
    created_at: Instant,
    expires_at: Instant,
    /// Set exactly once, by whoever wins the right to tear the sandbox down.
    teardown: OnceLock<SessionState>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: SessionId, handle: SandboxHandle, channel: SandboxChannel, lifetime: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            created_at: now,
            expires_at: now + lifetime,
            teardown: OnceLock::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Creating,
                history: OutputHistory::default(),
                channel,
                last_prompt: None,
                last_activity_at: now,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Fixed lifetime from creation; activity never extends it.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }

    /// Non-blocking view for listings while a turn may be in flight.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, SessionInner>> {
        self.inner.try_lock().ok()
    }

    /// Claim the teardown. Returns `false` if someone already did.
    pub fn claim_teardown(&self, reason: SessionState) -> bool {
        self.teardown.set(reason).is_ok()
    }

    /// Why the session is being or was torn down, if it is.
    pub fn teardown_reason(&self) -> Option<SessionState> {
        self.teardown.get().copied()
    }
}
