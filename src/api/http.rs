use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::error::BridgeError;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message.into() })))
}

impl From<BridgeError> for (StatusCode, Json<Value>) {
    fn from(e: BridgeError) -> Self {
        let status = match e {
            BridgeError::SlotNotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::RegistryFull => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::BadToken => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        err(status, e.to_string())
    }
}

/// `GET /api/token` — issue the session token + default cwd for the front-end.
pub async fn token(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "token": state.token.as_str(), "cwd": state.config.default_cwd }))
}

#[derive(Deserialize)]
pub struct CreateSessionBody {
    pub cwd: Option<String>,
}

/// `POST /api/sessions/create` — allocate a slot scoped to a cwd.
pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult {
    let cwd = body.cwd.unwrap_or_else(|| state.config.default_cwd.clone());
    let slot = state
        .registry
        .create_slot(cwd.clone(), &state.config)
        .await
        .map_err(<(StatusCode, Json<Value>)>::from)?;
    Ok(Json(json!({ "slotId": slot.id, "cwd": cwd })))
}

/// `GET /api/sessions/active` — list live slots.
pub async fn active_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions: Vec<Value> = state
        .registry
        .list_active()
        .await
        .into_iter()
        .map(|(slot_id, cwd, connected)| json!({ "slotId": slot_id, "cwd": cwd, "connected": connected }))
        .collect();
    Json(json!({ "sessions": sessions }))
}

/// `DELETE /api/sessions/active/:slotId` — destroy a slot.
pub async fn destroy_session(State(state): State<AppState>, Path(slot_id): Path<String>) -> ApiResult {
    state
        .registry
        .destroy_slot(&slot_id)
        .await
        .map_err(<(StatusCode, Json<Value>)>::from)?;
    Ok(Json(json!({ "ok": true })))
}

/// `GET /api/terminal/cwd` — the terminal's current working directory,
/// best-effort and platform-specific (just whatever the broker process's
/// own cwd resolves to; there is no per-session concept for terminals).
pub async fn terminal_cwd() -> Json<Value> {
    let cwd = std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| ".".to_string());
    Json(json!({ "cwd": cwd }))
}

#[derive(Deserialize)]
pub struct SessionsQuery {
    pub cwd: Option<String>,
}

/// `GET /api/sessions?cwd=…` — merged list: supplemented in-memory view,
/// since the broker itself is stateless across restarts (§6.4).
pub async fn sessions_for_cwd(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Json<Value> {
    let cwd = query.cwd.unwrap_or_else(|| state.config.default_cwd.clone());
    let slots = state.registry.by_cwd(&cwd).await;

    let mut sessions = Vec::with_capacity(slots.len());
    for slot in slots {
        let (slot_id, cwd, connected) = slot.snapshot().await;
        let agent_session_ids: Vec<String> = {
            let guard = slot.state.lock().await;
            guard.buffers.keys().cloned().collect()
        };
        sessions.push(json!({
            "slotId": slot_id,
            "cwd": cwd,
            "connected": connected,
            "agentSessionIds": agent_session_ids,
        }));
    }

    Json(json!({ "sessions": sessions }))
}
