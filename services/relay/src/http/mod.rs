//! HTTP surface: session lifecycle API, health, and the client WebSocket.

pub mod response;
pub mod sessions;

use crate::hub_manager::HubManager;
use crate::store::SharedStore;
use crate::ws_client::{WsState, ws_session_handler};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub store: SharedStore,
    pub manager: Arc<HubManager>,
}

pub fn build_router(store: SharedStore, manager: Arc<HubManager>) -> Router {
    let api = ApiState {
        store,
        manager: Arc::clone(&manager),
    };
    Router::new()
        .route("/healthz", get(sessions::healthz))
        .route(
            "/api/v1/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route("/api/v1/sessions/{session_id}", get(sessions::get_session))
        .route(
            "/api/v1/sessions/{session_id}/activate",
            post(sessions::activate_session),
        )
        .route(
            "/api/v1/sessions/{session_id}/archive",
            post(sessions::archive_session),
        )
        .with_state(api)
        .nest(
            "/ws/v1/sessions",
            Router::new()
                .route("/{session_id}", get(ws_session_handler))
                .with_state(WsState { manager }),
        )
        .layer(TraceLayer::new_for_http())
}
