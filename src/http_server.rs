//! HTTP server implementation using Axum.

use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::orchestrator::{InputRequest, PollRequest, RunRequest, RunResponse, SessionDetail};
use crate::registry::SessionSummary;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    kind: &'static str,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

impl SessionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Expired(_) => StatusCode::GONE,
            SessionError::UnsupportedLanguage(_) | SessionError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            SessionError::CallerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SessionError::Execution { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Creation(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Attach(_) | SessionError::Stream(_) | SessionError::Teardown(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (exit_code, output) = match &self {
            SessionError::Execution { exit_code, output } => (Some(*exit_code), Some(output.clone())),
            _ => (None, None),
        };
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
            retryable: self.is_retryable(),
            exit_code,
            output,
        };
        (status, Json(body)).into_response()
    }
}

/// All routes, with CORS and request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Conversation turns
        .route("/run", post(run))
        .route("/input", post(input))
        .route("/poll", post(poll))
        // Session management
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        // Health check
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port until ctrl-c, then drain sessions.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let sweeper = state.registry().spawn_sweeper();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();
    state.registry().shutdown().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health() -> &'static str {
    "OK"
}

async fn run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>, SessionError> {
    info!("POST /run - language: {}", req.language);
    Ok(Json(state.orchestrator.run(req).await?))
}

async fn input(
    State(state): State<AppState>,
    Json(req): Json<InputRequest>,
) -> Result<Json<RunResponse>, SessionError> {
    Ok(Json(state.orchestrator.input(req).await?))
}

async fn poll(
    State(state): State<AppState>,
    Json(req): Json<PollRequest>,
) -> Result<Json<RunResponse>, SessionError> {
    Ok(Json(state.orchestrator.poll(req).await?))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.orchestrator.list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, SessionError> {
    Ok(Json(state.orchestrator.describe(&id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, SessionError> {
    state.orchestrator.cancel(&id).await?;
    info!("Deleted session: {}", id);
    Ok(StatusCode::NO_CONTENT)
}
