//! Shared helpers for the integration tests: start a hub on a random port
//! and talk to it over WebSocket and HTTP.
#![allow(dead_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use push_hub_server::config::{Config, StorageBackend};
use push_hub_server::routes::build_router;
use push_hub_server::state::{AppState, Backends};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsWrite = SplitSink<WsStream, Message>;
pub type WsRead = SplitStream<WsStream>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
    pub state: AppState,
    pub shutdown: CancellationToken,
    _tmp_dir: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// In-memory configuration with a fixed instance id and a consumer group of
/// its own, so instances sharing a log each see every event.
pub fn test_config(instance_id: &str) -> Config {
    let mut config = Config::default();
    config.storage = StorageBackend::Memory;
    config.instance_id = Some(instance_id.to_string());
    config.sync.group_id = format!("group-{instance_id}");
    config.hub.announce_presence = false;
    config.longpoll.timeout_secs = 1;
    config
}

/// Start a server on 127.0.0.1 with a random port.
pub async fn start_server(mut config: Config, backends: Backends) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    config.data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let shutdown = CancellationToken::new();
    let (state, _tasks) = AppState::start(config, backends, shutdown.clone())
        .await
        .expect("Failed to start hub");
    let app = build_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await
        .unwrap();
    });

    TestServer {
        addr,
        base_url: format!("http://{addr}"),
        state,
        shutdown,
        _tmp_dir: tmp_dir,
    }
}

pub async fn start_default_server() -> TestServer {
    start_server(test_config("instance-test"), Backends::default()).await
}

/// Open a WebSocket with the given query string and wait until the hub has
/// registered the client id.
pub async fn connect_ws(server: &TestServer, id: &str, room: Option<&str>) -> (WsWrite, WsRead) {
    let url = match room {
        Some(room) => format!("ws://{}/ws?id={id}&room={room}", server.addr),
        None => format!("ws://{}/ws?id={id}", server.addr),
    };
    let (stream, _) = connect_async(&url).await.expect("Failed to connect WebSocket");
    wait_until_local(&server.state, id).await;
    stream.split()
}

/// Registration completes after the upgrade response, so poll for it.
pub async fn wait_until_local(state: &AppState, id: &str) {
    wait_for(|| state.hub.is_local(id)).await;
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not met in time");
}

/// Next JSON text frame, skipping control frames.
pub async fn next_json(read: &mut WsRead) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), read.next())
            .await
            .expect("Timed out waiting for a message")
            .expect("Stream ended")
            .expect("WebSocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected frame: {other:?}"),
        }
    }
}

/// Close code of the next close frame.
pub async fn next_close_code(read: &mut WsRead) -> u16 {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), read.next())
            .await
            .expect("Timed out waiting for close")
            .expect("Stream ended")
            .expect("WebSocket error");
        if let Message::Close(Some(close)) = frame {
            return u16::from(close.code);
        }
    }
}

pub async fn send_json(write: &mut WsWrite, value: Value) {
    write
        .send(Message::text(value.to_string()))
        .await
        .expect("Failed to send");
}

pub async fn push(server: &TestServer, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/push", server.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
}
