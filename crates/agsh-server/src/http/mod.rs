//! Transport gateway: control-plane REST API and the WebSocket stream.

pub mod api;
pub mod stream;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use agsh_core::WorkerRouter;

use crate::session::SessionRegistry;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<WorkerRouter>,
    pub dev_fallback_user: Option<String>,
}

/// Build the axum router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/route", get(api::route))
        .route("/sessions", post(api::create_session).get(api::list_sessions))
        .route("/sessions/{id}", delete(api::delete_session))
        .route("/sessions/{id}/resize", post(api::resize_session))
        .route("/sessions/{id}/send", post(api::send_to_session))
        .route("/sessions/{id}/stream", get(stream::stream_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
