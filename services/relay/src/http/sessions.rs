//! Session lifecycle API.
//!
//! Sessions are created and archived here, outside the hub: the hub only
//! ever looks sessions up.  Activation flips a `creating`/`idle`/`error`
//! session back to `active` so the next client attach succeeds.

use super::ApiState;
use super::response::{bad_request, conflict, internal_error, not_found};
use crate::store::{NewSession, Session, SessionMode, SessionStatus};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub id: Option<String>,
    pub mode: String,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub sandbox_provider: Option<String>,
    #[serde(default)]
    pub sandbox_provider_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Activate immediately when a sandbox binding is supplied (default).
    #[serde(default)]
    pub activate: Option<bool>,
}

fn session_json(session: &Session) -> serde_json::Value {
    serde_json::json!({
        "id": session.id,
        "mode": session.mode.as_str(),
        "status": session.status.as_str(),
        "sandboxProvider": session.sandbox_provider,
        "sandboxProviderId": session.sandbox_provider_id,
        "environmentId": session.environment_id,
        "repoId": session.repo_id,
        "name": session.name,
        "firstUserMessage": session.first_user_message,
        "createdAt": session.created_at.to_rfc3339(),
        "lastActivityAt": session.last_activity_at.to_rfc3339(),
    })
}

pub async fn create_session(
    State(state): State<ApiState>,
    Json(body): Json<CreateSessionBody>,
) -> impl IntoResponse {
    let Some(mode) = SessionMode::parse(&body.mode) else {
        return bad_request(format!("mode must be 'chat' or 'code', got '{}'", body.mode));
    };
    let id = body.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let new = NewSession {
        id: id.clone(),
        mode,
        environment_id: body.environment_id,
        repo_id: body.repo_id,
        sandbox_provider: body.sandbox_provider,
        sandbox_provider_id: body.sandbox_provider_id,
        name: body.name,
    };

    let store = state.store.lock().await;
    if matches!(store.get_session(&id), Ok(Some(_))) {
        return conflict(format!("session '{id}' already exists"));
    }
    let mut session = match store.create_session(&new) {
        Ok(session) => session,
        Err(e) => return internal_error(e),
    };
    if session.has_sandbox() && body.activate.unwrap_or(true) {
        if let Err(e) = store.set_status(&id, SessionStatus::Active) {
            return internal_error(e);
        }
        session.status = SessionStatus::Active;
    }
    info!(session_id = %id, status = session.status.as_str(), "session created");
    (StatusCode::CREATED, Json(session_json(&session))).into_response()
}

pub async fn list_sessions(State(state): State<ApiState>) -> impl IntoResponse {
    let store = state.store.lock().await;
    match store.list_sessions() {
        Ok(sessions) => {
            let sessions: Vec<serde_json::Value> = sessions.iter().map(session_json).collect();
            Json(serde_json::json!({ "sessions": sessions })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn get_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let store = state.store.lock().await;
    match store.get_session(&session_id) {
        Ok(Some(session)) => Json(session_json(&session)).into_response(),
        Ok(None) => not_found(format!("session '{session_id}' not found")),
        Err(e) => internal_error(e),
    }
}

/// Reactivate a session so clients can attach again.
pub async fn activate_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let store = state.store.lock().await;
    let session = match store.get_session(&session_id) {
        Ok(Some(session)) => session,
        Ok(None) => return not_found(format!("session '{session_id}' not found")),
        Err(e) => return internal_error(e),
    };
    match session.status {
        SessionStatus::Archived => {
            return conflict("archived sessions cannot be activated");
        }
        SessionStatus::Active => {}
        _ => {
            if let Err(e) = store.set_status(&session_id, SessionStatus::Active) {
                return internal_error(e);
            }
            if let Err(e) = store.touch(&session_id) {
                return internal_error(e);
            }
        }
    }
    info!(session_id = %session_id, "session activated");
    match store.get_session(&session_id) {
        Ok(Some(session)) => Json(session_json(&session)).into_response(),
        Ok(None) => not_found("session vanished"),
        Err(e) => internal_error(e),
    }
}

pub async fn archive_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    {
        let store = state.store.lock().await;
        match store.get_session(&session_id) {
            Ok(Some(_)) => {}
            Ok(None) => return not_found(format!("session '{session_id}' not found")),
            Err(e) => return internal_error(e),
        }
        if let Err(e) = store.set_status(&session_id, SessionStatus::Archived) {
            return internal_error(e);
        }
    }
    // Any live hub for the session is now stale; close it out.
    state.manager.remove_if_empty(&session_id).await;
    info!(session_id = %session_id, "session archived");
    StatusCode::NO_CONTENT.into_response()
}

pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
