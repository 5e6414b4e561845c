//! Waits for a session's program to produce something worth returning.
//!
//! A turn ends when the prompt heuristic fires, when output goes quiet for
//! the silence window, when the program exits, or when the overall budget
//! runs out. Everything read is appended to the session history as it
//! arrives, so a turn abandoned half-way loses nothing. Timers and the
//! channel borrow live on this future's stack and are released on every
//! exit path, including being dropped by the caller.

use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, instrument};

use crate::error::{Result, SessionError};
use crate::prompt;
use crate::sandbox::SandboxBackend;
use crate::sanitize::sanitize;
use crate::session::{Session, SessionInner, SessionState};

/// Default quiet period after output before a turn ends.
pub const DEFAULT_SILENCE: Duration = Duration::from_millis(500);
/// Default overall budget for one turn.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
/// How long to wait for the exit status once output has closed.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(2000);

const EXIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub silence: Duration,
    pub timeout: Duration,
    pub exit_grace: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            silence: DEFAULT_SILENCE,
            timeout: DEFAULT_TIMEOUT,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }
}

/// Why a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The heuristic thinks the program is blocked on a read.
    InputRequested { prompt: String },
    /// Output went quiet; the program may still be running.
    Paused,
    /// Budget ran out after some output arrived.
    Partial,
    /// Budget ran out with no output and the program is still alive.
    StillRunning,
    /// The program exited successfully.
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Text observed during this turn only.
    pub text: String,
    pub progress: Progress,
}

impl Observation {
    /// Whether the turn ended on the server-side budget.
    pub fn timed_out(&self) -> bool {
        matches!(self.progress, Progress::Partial | Progress::StillRunning)
    }
}

/// Run one turn against a locked session.
#[instrument(skip_all, fields(session_id = %session.id()))]
pub async fn wait_for_output(
    session: &Session,
    inner: &mut SessionInner,
    backend: &dyn SandboxBackend,
    options: &WaitOptions,
) -> Result<Observation> {
    let framing = inner.channel.framing;
    let mut text = String::new();
    let mut received = false;

    let budget = sleep_until(Instant::now() + options.timeout);
    let silence = sleep(options.silence);
    tokio::pin!(budget, silence);

    loop {
        tokio::select! {
            // Budget first so a program that never stops printing still ends the turn
            biased;
            _ = &mut budget => {
                return finish_after_budget(session, inner, backend, text, received).await;
            }
            next = inner.channel.output.recv() => match next {
                Some(Ok(chunk)) => {
                    if chunk.bytes.is_empty() {
                        continue;
                    }
                    received = true;
                    let clean = sanitize(&chunk.bytes, framing);
                    debug!(stream = ?chunk.stream, raw = chunk.bytes.len(), clean = clean.len(), "chunk");
                    text.push_str(&clean);
                    inner.history.push(clean);
                    inner.touch();

                    let wait = prompt::detect(&text);
                    if wait.waiting_for_input {
                        let prompt = wait.input_prompt.unwrap_or_default();
                        return Ok(Observation { text, progress: Progress::InputRequested { prompt } });
                    }
                    silence.as_mut().reset(Instant::now() + options.silence);
                }
                Some(Err(e)) => return Err(SessionError::Stream(e.to_string())),
                None => return finish_after_close(session, inner, backend, options, text, received).await,
            },
            _ = &mut silence, if received => {
                return Ok(Observation { text, progress: Progress::Paused });
            }
        }
    }
}

/// The program closed its output: report how it ended.
async fn finish_after_close(
    session: &Session,
    inner: &SessionInner,
    backend: &dyn SandboxBackend,
    options: &WaitOptions,
    text: String,
    received: bool,
) -> Result<Observation> {
    if let Some(reason) = session.teardown_reason() {
        return Err(closed_error(session, reason));
    }

    let deadline = Instant::now() + options.exit_grace;
    loop {
        let status = backend.inspect(session.handle()).await?;
        match status.exit_code {
            Some(0) => return Ok(Observation { text, progress: Progress::Exited }),
            Some(exit_code) => {
                return Err(SessionError::Execution { exit_code, output: inner.history.text() })
            }
            None if Instant::now() >= deadline => {
                // Output closed but the process lingers
                let progress = if received { Progress::Paused } else { Progress::StillRunning };
                return Ok(Observation { text, progress });
            }
            None => sleep(EXIT_POLL).await,
        }
    }
}

/// The budget ran out. Partial output always wins over an error.
async fn finish_after_budget(
    session: &Session,
    inner: &SessionInner,
    backend: &dyn SandboxBackend,
    text: String,
    received: bool,
) -> Result<Observation> {
    if received {
        return Ok(Observation { text, progress: Progress::Partial });
    }
    if let Some(reason) = session.teardown_reason() {
        return Err(closed_error(session, reason));
    }
    let status = backend.inspect(session.handle()).await?;
    match status.exit_code {
        None => Ok(Observation { text, progress: Progress::StillRunning }),
        Some(0) => Ok(Observation { text, progress: Progress::Exited }),
        Some(exit_code) => Err(SessionError::Execution { exit_code, output: inner.history.text() }),
    }
}

fn closed_error(session: &Session, reason: SessionState) -> SessionError {
    match reason {
        SessionState::Expired => SessionError::Expired(session.id().to_string()),
        _ => SessionError::NotFound(session.id().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = WaitOptions::default();
        assert_eq!(options.silence, Duration::from_millis(500));
        assert_eq!(options.timeout, Duration::from_secs(5));
    }

    #[test]
    fn only_budget_outcomes_count_as_timeouts() {
        let observed = |progress| Observation { text: String::new(), progress };
        assert!(observed(Progress::Partial).timed_out());
        assert!(observed(Progress::StillRunning).timed_out());
        assert!(!observed(Progress::Paused).timed_out());
        assert!(!observed(Progress::Exited).timed_out());
    }
}
