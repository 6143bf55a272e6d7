use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use super::tracker::{OnlineUser, PresenceView};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub users: Vec<OnlineUser>,
    pub count: usize,
}

type ApiError = (StatusCode, Json<Value>);

fn unavailable(e: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %e, "Presence store unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "presence store unavailable"})),
    )
}

/// GET /api/presence/online
pub async fn list_online(State(state): State<AppState>) -> Result<Json<OnlineUsersResponse>, ApiError> {
    let users = state.presence.online_users().await.map_err(unavailable)?;
    Ok(Json(OnlineUsersResponse {
        count: users.len(),
        users,
    }))
}

/// GET /api/presence/{user_id}
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceView>, ApiError> {
    state
        .presence
        .lookup(&user_id)
        .await
        .map(Json)
        .map_err(unavailable)
}
