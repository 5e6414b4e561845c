//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::Orchestrator;
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::sandbox::SandboxBackend;
use crate::waiter::WaitOptions;

/// Handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        registry: RegistryConfig,
        wait: WaitOptions,
        request_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(backend, registry));
        Self {
            orchestrator: Arc::new(Orchestrator::new(registry, wait, request_timeout)),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.orchestrator.registry()
    }
}
