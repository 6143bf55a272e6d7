use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use std::net::SocketAddr;

use crate::chat::rooms;
use crate::hub::client::derive_client_id;
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for a WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub id: Option<String>,
    pub room: Option<String>,
}

/// Close code sent when the client may not join the requested room.
const CLOSE_NOT_ROOM_MEMBER: u16 = 4003;

/// GET /ws?id=&room=
/// Upgrades and registers a socket client. A client refused a room is
/// upgraded and immediately closed with [`CLOSE_NOT_ROOM_MEMBER`].
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let client_id = derive_client_id(params.id, addr);
    let room = params.room.filter(|r| !r.is_empty());
    let ws = ws.max_message_size(state.config.socket.max_frame_bytes);

    let admitted = rooms::admit(
        state.rooms.as_ref(),
        state.config.rooms.enforce_membership,
        room.as_deref(),
        &client_id,
    )
    .await;

    if !admitted {
        tracing::warn!(
            client_id = %client_id,
            room = room.as_deref().unwrap_or_default(),
            "WebSocket client refused room"
        );
        return ws.on_upgrade(move |mut socket| async move {
            let close_frame = CloseFrame {
                code: CLOSE_NOT_ROOM_MEMBER,
                reason: "Not a room member".into(),
            };
            let _ = socket.send(Message::Close(Some(close_frame))).await;
        });
    }

    tracing::debug!(client_id = %client_id, peer = %addr, "WebSocket upgrade accepted");
    ws.on_upgrade(move |socket| actor::run_connection(socket, state, client_id, room))
}
