use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;

use super::{wait, LongPollRegistry, PollOutcome};
use crate::chat::rooms;
use crate::hub::client::{derive_client_id, Client, ClientId};
use crate::hub::{Hub, HubError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub id: Option<String>,
    pub room: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendQuery {
    pub to: Option<String>,
}

/// Unregisters the poll's client and frees its slot however the request
/// ends, including when the HTTP request is dropped while registering or
/// waiting.
struct PollGuard {
    hub: Hub,
    registry: LongPollRegistry,
    id: ClientId,
    seq: u64,
    ticket: u64,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.registry.release(&self.id, self.ticket);
        let hub = self.hub.clone();
        let id = std::mem::take(&mut self.id);
        let seq = self.seq;
        tokio::spawn(async move {
            if let Err(e) = hub.unregister(&id, seq).await {
                tracing::debug!(client_id = %id, error = %e, "Long-poll unregister failed");
            }
        });
    }
}

/// GET /longpoll?id=&room=
/// Blocks until a message arrives (200 with the message body), the timeout
/// passes or a newer poll takes over (204), or the client is canceled
/// (200 `{"status":"canceled"}`).
pub async fn long_poll(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<PollQuery>,
) -> Response {
    let client_id = derive_client_id(params.id, addr);
    let room = params.room.filter(|r| !r.is_empty());

    let admitted = rooms::admit(
        state.rooms.as_ref(),
        state.config.rooms.enforce_membership,
        room.as_deref(),
        &client_id,
    )
    .await;
    if !admitted {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "not a room member"})),
        )
            .into_response();
    }

    let mut subscription = state.longpoll.subscribe(&client_id);
    let client = Client::long_poll(client_id.clone(), room, subscription.sender());
    let handle = client.handle().clone();

    // In place before registering, so a request dropped mid-registration
    // still unregisters and frees its slot.
    let _guard = PollGuard {
        hub: state.hub.clone(),
        registry: state.longpoll.clone(),
        id: client_id.clone(),
        seq: handle.seq(),
        ticket: subscription.ticket,
    };

    match state.hub.register(client).await {
        Ok(_) => {}
        Err(HubError::Presence { client_id, source }) => {
            tracing::warn!(client_id = %client_id, error = %source, "Registered without presence update");
        }
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "Rejecting long-poll, hub unavailable");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    }

    let outcome = wait(&mut subscription.rx, &handle, state.config.longpoll.timeout()).await;
    tracing::debug!(client_id = %client_id, outcome = ?outcome, "Long-poll finished");

    match outcome {
        PollOutcome::Delivered(body) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        PollOutcome::NoData | PollOutcome::Superseded => StatusCode::NO_CONTENT.into_response(),
        PollOutcome::Canceled => (StatusCode::OK, Json(json!({"status": "canceled"}))).into_response(),
    }
}

/// POST /send?to=
/// Hands the raw body to the waiting long-poll client `to`.
pub async fn send_to_waiter(
    State(state): State<AppState>,
    Query(params): Query<SendQuery>,
    body: Bytes,
) -> Response {
    let Some(to) = params.to.filter(|t| !t.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing recipient"})),
        )
            .into_response();
    };

    if state.longpoll.send(&to, body) {
        (StatusCode::OK, Json(json!({"status": "sent"}))).into_response()
    } else {
        tracing::debug!(to = %to, "No long-poll subscriber waiting");
        (StatusCode::NOT_FOUND, Json(json!({"error": "no subscriber"}))).into_response()
    }
}
