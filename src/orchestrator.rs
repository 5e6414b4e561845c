//! Routes "new run", "send input", "poll" and "cancel" requests onto the
//! registry and the waiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::error::{Result, SessionError};
use crate::registry::{summarize, SessionRegistry, SessionSummary};
use crate::session::{Session, SessionInner, SessionState};
use crate::waiter::{wait_for_output, Observation, Progress, WaitOptions};

/// The single runtime sandboxes provide.
pub const SUPPORTED_LANGUAGE: &str = "python";

pub const STILL_RUNNING_MESSAGE: &str = "still running, no output yet";
pub const COMPLETED_MESSAGE: &str = "completed, no output";

/// Default caller-side budget for one request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub session_id: String,
    pub input: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub waiting_for_input: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_prompt: Option<String>,
    pub state: SessionState,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    /// `None` while a turn holds the session.
    pub history: Option<Vec<String>>,
}

pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    wait: WaitOptions,
    request_timeout: Duration,
}

impl Orchestrator {
    pub fn new(registry: Arc<SessionRegistry>, wait: WaitOptions, request_timeout: Duration) -> Self {
        Self {
            registry,
            wait,
            request_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start a new session for `code` and return its first turn.
    #[instrument(skip_all, fields(language = %req.language))]
    pub async fn run(&self, req: RunRequest) -> Result<RunResponse> {
        if !req.language.trim().eq_ignore_ascii_case(SUPPORTED_LANGUAGE) {
            return Err(SessionError::UnsupportedLanguage(req.language));
        }
        if req.code.trim().is_empty() {
            return Err(SessionError::InvalidRequest("code must not be empty".to_string()));
        }
        let session = self.registry.create(&req.code).await?;
        info!(session_id = %session.id(), "run started");
        self.turn(session, None).await
    }

    /// Send one line of input to a live session and return the next turn.
    #[instrument(skip_all, fields(session_id = %req.session_id))]
    pub async fn input(&self, req: InputRequest) -> Result<RunResponse> {
        let session = self.live_session(&req.session_id).await?;
        self.turn(session, Some(req.input)).await
    }

    /// Collect whatever the session printed since the last turn.
    #[instrument(skip_all, fields(session_id = %req.session_id))]
    pub async fn poll(&self, req: PollRequest) -> Result<RunResponse> {
        let session = self.live_session(&req.session_id).await?;
        self.turn(session, None).await
    }

    /// Tear a session down regardless of its state.
    #[instrument(skip(self))]
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        self.live_session(session_id).await?;
        if self.registry.remove(session_id, SessionState::Cancelled).await {
            info!("session cancelled");
        }
        Ok(())
    }

    pub async fn describe(&self, session_id: &str) -> Result<SessionDetail> {
        let session = self.live_session(session_id).await?;
        let summary = summarize(&session, Instant::now());
        let history = session.try_lock().map(|inner| inner.history.entries().to_vec());
        Ok(SessionDetail { summary, history })
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        self.registry.list().await
    }

    async fn live_session(&self, session_id: &str) -> Result<Arc<Session>> {
        if session_id.trim().is_empty() {
            return Err(SessionError::InvalidRequest("sessionId must not be empty".to_string()));
        }
        self.registry.get(session_id).await
    }

    /// One request/response turn under the caller-side budget. Running out
    /// of budget leaves the session alive for a later poll.
    async fn turn(&self, session: Arc<Session>, input: Option<String>) -> Result<RunResponse> {
        match timeout(self.request_timeout, self.drive(&session, input)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(session_id = %session.id(), "request budget exhausted");
                Err(SessionError::CallerTimeout {
                    budget_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn drive(&self, session: &Session, input: Option<String>) -> Result<RunResponse> {
        let backend = self.registry.backend();
        let mut inner = session.lock().await;
        if inner.state().is_terminal() || session.teardown_reason().is_some() {
            return Err(SessionError::NotFound(session.id().to_string()));
        }

        if let Some(text) = input {
            inner.transition(SessionState::Processing);
            inner.last_prompt = None;
            inner.history.push(format!("{text}\n"));
            inner.touch();
            if let Err(e) = backend.write_input(session.handle(), &text).await {
                // A program that already exited cannot read; the waiter reports the exit
                let exited = matches!(backend.inspect(session.handle()).await, Ok(status) if !status.running);
                if !exited {
                    drop(inner);
                    return Err(self.fail(session, e).await);
                }
            }
        }

        match wait_for_output(session, &mut inner, backend, &self.wait).await {
            Ok(observed) => {
                let next = next_state(inner.state(), &observed);
                inner.transition(next);
                match &observed.progress {
                    Progress::InputRequested { prompt } => inner.last_prompt = Some(prompt.clone()),
                    _ if next != SessionState::AwaitingInput => inner.last_prompt = None,
                    _ => {}
                }
                let response = respond(session, &inner, &observed);
                drop(inner);
                if next.is_terminal() {
                    self.registry.remove(session.id(), next).await;
                }
                Ok(response)
            }
            Err(e @ (SessionError::NotFound(_) | SessionError::Expired(_))) => Err(e),
            Err(e) => {
                drop(inner);
                Err(self.fail(session, e).await)
            }
        }
    }

    /// Mark the session failed and reclaim it.
    async fn fail(&self, session: &Session, error: SessionError) -> SessionError {
        warn!(session_id = %session.id(), error = %error, "session failed");
        session.lock().await.transition(SessionState::Failed);
        self.registry.remove(session.id(), SessionState::Failed).await;
        error
    }
}

/// A quiet turn leaves a pending read pending; new output without a prompt
/// means the program moved on.
fn next_state(current: SessionState, observed: &Observation) -> SessionState {
    match observed.progress {
        Progress::InputRequested { .. } => SessionState::AwaitingInput,
        Progress::Exited => SessionState::Completed,
        Progress::Paused | Progress::Partial | Progress::StillRunning => match current {
            SessionState::AwaitingInput if observed.text.is_empty() => SessionState::AwaitingInput,
            SessionState::Processing => SessionState::Processing,
            _ => SessionState::AwaitingOutput,
        },
    }
}

fn respond(session: &Session, inner: &SessionInner, observed: &Observation) -> RunResponse {
    let state = inner.state();
    let output = if inner.history.is_empty() {
        match observed.progress {
            Progress::StillRunning => STILL_RUNNING_MESSAGE.to_string(),
            Progress::Exited => COMPLETED_MESSAGE.to_string(),
            _ => String::new(),
        }
    } else {
        inner.history.text()
    };
    let waiting_for_input = state == SessionState::AwaitingInput;

    RunResponse {
        output,
        session_id: (!state.is_terminal()).then(|| session.id().to_string()),
        waiting_for_input,
        input_prompt: if waiting_for_input { inner.last_prompt.clone() } else { None },
        state,
        timed_out: observed.timed_out(),
    }
}
