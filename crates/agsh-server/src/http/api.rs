//! Control-plane handlers: session CRUD, resize, placement, health.
//!
//! Errors map to HTTP statuses in one place (`ApiError`); bodies are JSON
//! with camelCase fields, errors are `{"error": "..."}`.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use tracing::warn;

use agsh_core::AgshError;

use crate::auth::caller_identity;
use crate::session::{CreateParams, SessionRegistry};

use super::AppState;

/// Taxonomy → HTTP status mapping.
pub struct ApiError(AgshError);

impl From<AgshError> for ApiError {
    fn from(err: AgshError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgshError::NotFound(_) => StatusCode::NOT_FOUND,
            AgshError::AlreadyExists(_) => StatusCode::CONFLICT,
            AgshError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AgshError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AgshError::InvalidFrame(_) => StatusCode::BAD_REQUEST,
            AgshError::Spawn(_)
            | AgshError::Workspace(_)
            | AgshError::Transport(_)
            | AgshError::Io(_)
            | AgshError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "control plane request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub name: String,
    pub workdir: Option<PathBuf>,
    pub repo_url: Option<String>,
    pub initial_command: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub id: String,
    pub name: String,
    pub workdir: String,
    pub alive: bool,
    pub created_at: u64,
}

/// `POST /sessions`
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = caller_identity(&headers, state.dev_fallback_user.as_deref())?;
    let session = state
        .registry
        .create(
            &identity.user,
            CreateParams {
                name: req.name,
                workdir: req.workdir,
                repo_url: req.repo_url,
                initial_command: req.initial_command,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SessionCreated {
            id: session.id.clone(),
            name: session.name.clone(),
            workdir: session.workdir.display().to_string(),
            alive: session.is_alive(),
            created_at: session.created_at_unix_ms(),
        }),
    ))
}

/// `GET /sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let identity = caller_identity(&headers, state.dev_fallback_user.as_deref())?;
    Ok(Json(state.registry.list(&identity.user).await))
}

/// `DELETE /sessions/{id}`
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = caller_identity(&headers, state.dev_fallback_user.as_deref())?;
    owned_session(&state.registry, &id, &identity.user).await?;
    state.registry.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}

/// `POST /sessions/{id}/resize`
pub async fn resize_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = caller_identity(&headers, state.dev_fallback_user.as_deref())?;
    owned_session(&state.registry, &id, &identity.user).await?;
    state.registry.resize(&id, req.rows, req.cols).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub text: String,
}

/// `POST /sessions/{id}/send` — fire-and-forget input injection, ensuring a
/// trailing newline so the line actually executes.
pub async fn send_to_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = caller_identity(&headers, state.dev_fallback_user.as_deref())?;
    let session = owned_session(&state.registry, &id, &identity.user).await?;
    let mut text = req.text;
    if !text.ends_with('\n') {
        text.push('\n');
    }
    let bytes = text.len();
    session.write(text.into_bytes()).await?;
    Ok(Json(json!({ "bytes": bytes })))
}

/// `GET /route` — resolve fleet placement for the calling identity.
pub async fn route(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let identity = caller_identity(&headers, state.dev_fallback_user.as_deref())?;
    match state.router.route(&identity.user) {
        Some(worker) => Ok(Json(json!({
            "identity": identity.user,
            "worker": worker,
        }))
        .into_response()),
        None => Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no workers configured" })),
        )
            .into_response()),
    }
}

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "activeSessions": state.registry.active_count().await,
        "maxSessions": state.registry.limits().max_sessions,
    }))
}

/// Fetch a session, masking other owners' sessions as not-found.
async fn owned_session(
    registry: &SessionRegistry,
    id: &str,
    owner: &str,
) -> Result<std::sync::Arc<crate::session::Session>, ApiError> {
    let session = registry.get(id).await?;
    if session.owner != owner {
        return Err(AgshError::NotFound(id.to_string()).into());
    }
    Ok(session)
}
