//! REST ingestion of messages from upstream systems.

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::hub::message::Message;
use crate::hub::PushError;
use crate::state::AppState;

/// POST /api/push
/// Body is a JSON message. Persisted first when history is enabled, then
/// queued for fleet-wide delivery.
pub async fn push_message(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<Value>) {
    let msg = match Message::decode(&body) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected pushed message");
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})));
        }
    };

    if state.config.history.enabled {
        if let Err(e) = state.messages.store(&msg).await {
            tracing::error!(error = %e, kind = %msg.kind, "Failed to persist pushed message");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to persist message"})),
            );
        }
    }

    match state.hub.push_message(msg) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))),
        Err(PushError::Invalid(e)) => (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))),
        Err(e @ (PushError::QueueFull | PushError::Stopped)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.to_string()})),
        ),
    }
}
