use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};

use crate::hub::client::{Client, ClientHandle, ClientId, CloseReason};
use crate::hub::HubError;
use crate::state::AppState;
use crate::ws::protocol;

/// Run one socket connection: register with the hub, then read and write
/// until either side ends, and unregister.
///
/// The write task owns the sink. It drains the outbound queue, pings on an
/// interval and finishes with a Close frame carrying the close reason. The
/// read loop owns the stream and enforces the read deadline.
pub async fn run_connection(socket: WebSocket, state: AppState, client_id: ClientId, room: Option<String>) {
    let settings = &state.config.socket;
    let (client, outbound) = Client::socket(client_id.clone(), room.clone(), settings.send_buffer);
    let handle = client.handle().clone();

    match state.hub.register(client).await {
        Ok(_) => {}
        Err(HubError::Presence { client_id, source }) => {
            tracing::warn!(client_id = %client_id, error = %source, "Registered without presence update");
        }
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "Rejecting socket, hub unavailable");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CloseReason::Shutdown.close_code(),
                    reason: CloseReason::Shutdown.as_str().into(),
                })))
                .await;
            return;
        }
    }

    tracing::info!(
        client_id = %client_id,
        room = room.as_deref().unwrap_or_default(),
        "WebSocket actor started"
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(writer_task(
        sink,
        outbound,
        handle.clone(),
        settings.ping_interval(),
        settings.write_wait(),
    ));

    read_loop(stream, &state, &handle, settings.read_deadline()).await;

    match state.hub.unregister(handle.id(), handle.seq()).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!(client_id = %client_id, "Connection already replaced or evicted"),
        Err(e) => tracing::warn!(client_id = %client_id, error = %e, "Unregister failed"),
    }
    // Ends the writer even if the hub could not be reached.
    handle.close(CloseReason::Normal);
    let _ = writer.await;

    tracing::info!(
        client_id = %client_id,
        reason = handle.close_reason().as_str(),
        "WebSocket actor stopped"
    );
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    handle: &ClientHandle,
    read_deadline: Duration,
) {
    loop {
        let next = tokio::select! {
            _ = handle.cancelled() => break,
            next = timeout(read_deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                tracing::info!(client_id = %handle.id(), "Read deadline exceeded");
                break;
            }
            Ok(None) => {
                tracing::debug!(client_id = %handle.id(), "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::debug!(client_id = %handle.id(), error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => protocol::handle_text(&state.hub, handle.id(), text.as_str()),
            Message::Binary(data) => {
                tracing::debug!(client_id = %handle.id(), bytes = data.len(), "Ignoring binary frame");
            }
            // Pings are answered by the protocol layer; both renew the deadline.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                tracing::debug!(client_id = %handle.id(), frame = ?frame, "Client initiated close");
                break;
            }
        }
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    handle: ClientHandle,
    ping_interval: Duration,
    write_wait: Duration,
) {
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        let frame = tokio::select! {
            biased;
            _ = handle.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => to_ws_message(frame),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(client_id = %handle.id(), error = %e, "WebSocket write failed");
                handle.close(CloseReason::Normal);
                return;
            }
            Err(_) => {
                tracing::warn!(client_id = %handle.id(), "WebSocket write deadline exceeded");
                handle.close(CloseReason::Normal);
                return;
            }
        }
    }

    let reason = handle.close_reason();
    let close = Message::Close(Some(CloseFrame {
        code: reason.close_code(),
        reason: reason.as_str().into(),
    }));
    let _ = timeout(write_wait, sink.send(close)).await;
}

/// Frames are JSON, so they go out as text; anything else as binary.
fn to_ws_message(frame: Bytes) -> Message {
    match std::str::from_utf8(&frame) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(frame),
    }
}
