//! Session registry: the only structure shared between sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, instrument, warn};

use crate::error::{Result, SessionError};
use crate::sandbox::SandboxBackend;
use crate::session::{Session, SessionId, SessionState};

/// Session lifetime in seconds (5 minutes)
pub const SESSION_TTL_SECS: u64 = 300;
/// Seconds between expiry sweeps
pub const SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Absolute lifetime measured from creation.
    pub lifetime: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(SESSION_TTL_SECS),
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
        }
    }
}

/// Listing entry. `state` is `None` while a turn holds the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: Option<SessionState>,
    pub age_secs: u64,
    pub idle_secs: Option<u64>,
    pub expires_in_secs: u64,
}

pub struct SessionRegistry {
    backend: Arc<dyn SandboxBackend>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn SandboxBackend>, config: RegistryConfig) -> Self {
        Self {
            backend,
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn backend(&self) -> &dyn SandboxBackend {
        self.backend.as_ref()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create a sandbox for `source`, attach to it and register the session.
    /// Nothing is registered unless both steps succeed, and a sandbox whose
    /// attach failed is destroyed before returning.
    #[instrument(skip_all)]
    pub async fn create(&self, source: &str) -> Result<Arc<Session>> {
        let handle = self.backend.create(source).await?;

        let channel = match self.backend.attach(&handle).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(cleanup) = self.backend.destroy(&handle).await {
                    warn!(sandbox_id = %handle.id(), error = %cleanup, "destroy after failed attach");
                }
                return Err(match e {
                    SessionError::Attach(_) => e,
                    other => SessionError::Attach(other.to_string()),
                });
            }
        };

        let mut sessions = self.sessions.write().await;
        let id = loop {
            let id = uuid::Uuid::new_v4().to_string();
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let session = Arc::new(Session::new(id.clone(), handle, channel, self.config.lifetime));
        session.lock().await.transition(SessionState::AwaitingOutput);
        sessions.insert(id.clone(), session.clone());
        info!(session_id = %id, sandbox_id = %session.handle().id(), "created session");
        Ok(session)
    }

    /// Look up a live session. A session past its lifetime is expired on
    /// the spot.
    pub async fn get(self: &Arc<Self>, id: &str) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if session.is_expired(Instant::now()) {
            self.remove(id, SessionState::Expired).await;
            return Err(SessionError::Expired(id.to_string()));
        }
        match session.teardown_reason() {
            Some(SessionState::Expired) => Err(SessionError::Expired(id.to_string())),
            Some(_) => Err(SessionError::NotFound(id.to_string())),
            None => Ok(session),
        }
    }

    /// Tear down the sandbox, then drop the entry. Idempotent: only the
    /// first caller for an id does any work. The work runs on its own task so
    /// a caller giving up half-way cannot leave a claimed but undestroyed
    /// session behind.
    pub async fn remove(self: &Arc<Self>, id: &str, reason: SessionState) -> bool {
        let registry = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move { registry.remove_entry(&id, reason).await })
            .await
            .unwrap_or(false)
    }

    #[instrument(skip(self))]
    async fn remove_entry(&self, id: &str, reason: SessionState) -> bool {
        let Some(session) = self.sessions.read().await.get(id).cloned() else {
            return false;
        };
        if !self.teardown(&session, reason).await {
            return false;
        }
        self.sessions.write().await.remove(id);
        info!(session_id = %id, ?reason, "removed session");
        true
    }

    /// Destroy the sandbox exactly once. Failures are logged and absorbed.
    async fn teardown(&self, session: &Session, reason: SessionState) -> bool {
        if !session.claim_teardown(reason) {
            return false;
        }
        if let Err(e) = self.backend.destroy(session.handle()).await {
            warn!(session_id = %session.id(), error = %e, "sandbox teardown failed");
        }
        // The destroyed sandbox closes its channel, which ends any turn
        // still holding the lock
        let mut inner = session.lock().await;
        if !inner.state().is_terminal() {
            inner.transition(reason);
        }
        true
    }

    /// Remove every session older than the fixed lifetime.
    pub async fn sweep(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id().to_string())
            .collect();

        let mut removed = 0;
        for id in expired {
            info!(session_id = %id, "expiring session");
            if self.remove(&id, SessionState::Expired).await {
                removed += 1;
            }
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) on the configured interval until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(registry.config.sweep_interval);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }

    /// Tear down every live session.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        info!(count = ids.len(), "draining sessions");
        join_all(ids.iter().map(|id| self.remove(id, SessionState::Cancelled))).await;
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let now = Instant::now();
        let mut list: Vec<SessionSummary> = sessions.iter().map(|s| summarize(s, now)).collect();
        list.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then_with(|| a.id.cmp(&b.id)));
        list
    }
}

pub fn summarize(session: &Session, now: Instant) -> SessionSummary {
    let inner = session.try_lock();
    SessionSummary {
        id: session.id().to_string(),
        state: inner.as_ref().map(|i| i.state()),
        age_secs: now.duration_since(session.created_at()).as_secs(),
        idle_secs: inner.as_ref().map(|i| now.duration_since(i.last_activity_at).as_secs()),
        expires_in_secs: session.expires_at().saturating_duration_since(now).as_secs(),
    }
}
