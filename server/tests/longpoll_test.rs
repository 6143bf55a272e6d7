//! Integration tests for long-poll clients.
//! Tests cover: empty timeout, direct hand-off through /send, hub delivery
//! to a waiting poll, a newer poll replacing an older one, room refusal and
//! cleanup after an abandoned request.

mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use push_hub_server::chat::rooms::MemoryRoomMembership;
use push_hub_server::db::StoreError;
use push_hub_server::presence::{MemoryPresenceStore, PresenceRecord, PresenceStatus, PresenceStore};
use push_hub_server::state::Backends;

/// Start a poll in the background and wait until it holds a slot.
async fn start_poll(server: &TestServer, query: &str, id: &str) -> tokio::task::JoinHandle<reqwest::Response> {
    let url = format!("{}/longpoll?{query}", server.base_url);
    let handle = tokio::spawn(async move { reqwest::get(url).await.unwrap() });
    wait_for(|| server.state.longpoll.is_waiting(id) && server.state.hub.is_local(id)).await;
    handle
}

#[tokio::test]
async fn test_poll_times_out_with_no_content() {
    let server = start_default_server().await;

    let started = Instant::now();
    let resp = reqwest::get(format!("{}/longpoll?id=idle", server.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(started.elapsed() >= Duration::from_millis(900));

    // The client is unregistered once the request completes.
    wait_for(|| !server.state.hub.is_local("idle")).await;
    assert!(!server.state.longpoll.is_waiting("idle"));
}

#[tokio::test]
async fn test_send_hands_body_to_waiting_poll() {
    let server = start_default_server().await;
    let poll = start_poll(&server, "id=lp1", "lp1").await;

    let resp = reqwest::Client::new()
        .post(format!("{}/send?to=lp1", server.base_url))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "sent");

    let resp = poll.await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_send_without_waiter_or_recipient() {
    let server = start_default_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/send?to=ghost", server.base_url))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "no subscriber");

    let resp = client
        .post(format!("{}/send", server.base_url))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_pushed_message_completes_poll() {
    let server = start_default_server().await;
    let poll = start_poll(&server, "id=lp2&room=r1", "lp2").await;

    let resp = push(&server, json!({"type": "chat", "room": "r1", "payload": {"text": "hi"}})).await;
    assert_eq!(resp.status(), 202);

    let resp = poll.await.unwrap();
    assert_eq!(resp.status(), 200);
    let msg: Value = resp.json().await.unwrap();
    assert_eq!(msg["type"], "chat");
    assert_eq!(msg["room"], "r1");
    assert_eq!(msg["payload"]["text"], "hi");
}

#[tokio::test]
async fn test_newer_poll_replaces_older() {
    let mut config = test_config("instance-lp");
    config.longpoll.timeout_secs = 10;
    let server = start_server(config, Backends::default()).await;

    let first = start_poll(&server, "id=lp3", "lp3").await;
    let ticket_holder = tokio::spawn({
        let url = format!("{}/longpoll?id=lp3", server.base_url);
        async move { reqwest::get(url).await.unwrap() }
    });

    let resp = tokio::time::timeout(Duration::from_secs(3), first)
        .await
        .expect("Older poll was not released")
        .unwrap();
    assert_eq!(resp.status(), 204);

    wait_for(|| server.state.longpoll.is_waiting("lp3")).await;
    let resp = push(&server, json!({"type": "chat", "to": "lp3", "payload": "for the new poll"})).await;
    assert_eq!(resp.status(), 202);

    let resp = ticket_holder.await.unwrap();
    assert_eq!(resp.status(), 200);
    let msg: Value = resp.json().await.unwrap();
    assert_eq!(msg["payload"], "for the new poll");
}

#[tokio::test]
async fn test_poll_refused_for_non_member() {
    let mut config = test_config("instance-lp-rooms");
    config.rooms.enforce_membership = true;
    let rooms = Arc::new(MemoryRoomMembership::new());
    rooms.join("r1", "member");
    let server = start_server(
        config,
        Backends {
            rooms: Some(rooms),
            ..Default::default()
        },
    )
    .await;

    let resp = reqwest::get(format!("{}/longpoll?id=outsider&room=r1", server.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert!(!server.state.hub.is_local("outsider"));

    let poll = start_poll(&server, "id=member&room=r1", "member").await;
    let resp = poll.await.unwrap();
    assert_eq!(resp.status(), 204);
}

/// Online writes stall, holding registration open.
struct SlowOnlineStore {
    inner: MemoryPresenceStore,
}

#[async_trait::async_trait]
impl PresenceStore for SlowOnlineStore {
    async fn set_status(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        if record.is_online() {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.inner.set_status(record).await
    }

    async fn get_status(&self, user_id: &str) -> Result<Option<PresenceRecord>, StoreError> {
        self.inner.get_status(user_id).await
    }

    async fn online_users(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        self.inner.online_users().await
    }
}

#[tokio::test]
async fn test_poll_abandoned_while_registering_is_cleaned_up() {
    let store = Arc::new(SlowOnlineStore {
        inner: MemoryPresenceStore::new(),
    });
    let server = start_server(
        test_config("instance-lp-abandon"),
        Backends {
            presence_store: Some(store.clone()),
            ..Default::default()
        },
    )
    .await;

    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let result = impatient
        .get(format!("{}/longpoll?id=ghost", server.base_url))
        .send()
        .await;
    assert!(result.is_err());

    wait_for(|| !server.state.hub.is_local("ghost") && !server.state.longpoll.is_waiting("ghost")).await;

    let mut status = None;
    for _ in 0..100 {
        status = store.get_status("ghost").await.unwrap().map(|r| r.status);
        if status == Some(PresenceStatus::Offline) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, Some(PresenceStatus::Offline));

    let body: Value = reqwest::get(format!("{}/api/presence/online", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 0);
}
