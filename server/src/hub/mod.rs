//! Connection hub: the client registry and its event loop.
//!
//! One task owns the client and room maps and serializes every mutation.
//! Everything else talks to it through [`Hub`], a cheap cloneable handle.

pub mod client;
pub mod message;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::StoreError;
use crate::presence::{PresenceRecord, PresenceTracker};
use crate::sync::SyncProducer;
use client::{Client, ClientHandle, ClientId, CloseReason};
use message::{Message, MessageError};
use registry::{HubStats, HubStatsSnapshot, Registry};

pub use registry::{new_local_index, LocalEntry, LocalIndex};

/// Hub settings. Exposed in `push-hub.toml` under the `[hub]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Capacity of the broadcast queue feeding the routing loop (default: 256)
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Send `presence` messages to local clients when users come and go
    #[serde(default = "default_announce_presence")]
    pub announce_presence: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: default_broadcast_capacity(),
            announce_presence: default_announce_presence(),
        }
    }
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_announce_presence() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub is not running")]
    Stopped,
    /// The registry change succeeded but the presence store write failed.
    #[error("presence update for {client_id} failed: {source}")]
    Presence {
        client_id: ClientId,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("broadcast queue full")]
    QueueFull,
    #[error(transparent)]
    Invalid(#[from] MessageError),
    #[error("hub is not running")]
    Stopped,
}

/// How far a routed message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Deliver locally and publish to the other instances.
    Fleet,
    /// Deliver locally only.
    Local,
}

struct Routed {
    msg: Message,
    scope: Scope,
}

struct RegisterCmd {
    client: Client,
    presence: PresenceReply,
}

struct UnregisterCmd {
    id: ClientId,
    seq: u64,
    ack: oneshot::Sender<bool>,
    presence: PresenceReply,
}

type PresenceReply = oneshot::Sender<Result<(), StoreError>>;

/// A registry change whose presence side effects are still pending.
enum PresenceEvent {
    Arrived {
        id: ClientId,
        reply: Option<PresenceReply>,
    },
    Departed {
        id: ClientId,
        reply: Option<PresenceReply>,
    },
}

/// Presence side effects of clients arriving and leaving.
#[derive(Clone)]
struct PresenceHooks {
    tracker: Option<PresenceTracker>,
    broadcast_tx: mpsc::Sender<Routed>,
    instance_id: Arc<str>,
    announce: bool,
}

impl PresenceHooks {
    async fn arrived(&self, id: &str) -> Result<(), StoreError> {
        let stored = match &self.tracker {
            Some(tracker) => tracker.mark_online(id).await,
            None => Ok(()),
        };
        self.announce(PresenceRecord::online(id, &self.instance_id)).await;
        stored
    }

    async fn departed(&self, id: &str) -> Result<(), StoreError> {
        let stored = match &self.tracker {
            Some(tracker) => tracker.mark_offline(id).await,
            None => Ok(()),
        };
        self.announce(PresenceRecord::offline(id)).await;
        stored
    }

    async fn announce(&self, record: PresenceRecord) {
        if !self.announce {
            return;
        }
        let routed = Routed {
            msg: record.announcement(),
            scope: Scope::Local,
        };
        if self.broadcast_tx.send(routed).await.is_err() {
            tracing::debug!(user_id = %record.user_id, "Hub stopped, presence announcement dropped");
        }
    }
}

struct HubInner {
    register_tx: mpsc::Sender<RegisterCmd>,
    unregister_tx: mpsc::Sender<UnregisterCmd>,
    broadcast_tx: mpsc::Sender<Routed>,
    index: LocalIndex,
    stats: Arc<HubStats>,
    instance_id: Arc<str>,
    announce: bool,
}

/// Handle to the running hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Start the hub loop and the presence task. The returned handle
    /// completes once the loop has closed every client after `shutdown`
    /// and their departures are recorded.
    pub fn spawn(
        config: &HubConfig,
        index: LocalIndex,
        instance_id: &str,
        presence: Option<PresenceTracker>,
        producer: Option<SyncProducer>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (register_tx, register_rx) = mpsc::channel(64);
        let (unregister_tx, unregister_rx) = mpsc::channel(64);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();

        let stats = Arc::new(HubStats::default());
        let instance_id: Arc<str> = Arc::from(instance_id);
        let hooks = PresenceHooks {
            tracker: presence,
            broadcast_tx: broadcast_tx.clone(),
            instance_id: instance_id.clone(),
            announce: config.announce_presence,
        };

        let presence_task = tokio::spawn(run_presence(presence_rx, hooks));
        let event_loop = HubLoop {
            registry: Registry::new(index.clone(), stats.clone()),
            register_rx,
            unregister_rx,
            broadcast_rx,
            presence_tx,
            producer,
        };
        let task = tokio::spawn(async move {
            event_loop.run(shutdown).await;
            let _ = presence_task.await;
        });

        let hub = Self {
            inner: Arc::new(HubInner {
                register_tx,
                unregister_tx,
                broadcast_tx,
                index,
                stats,
                instance_id,
                announce: config.announce_presence,
            }),
        };
        (hub, task)
    }

    /// Register a client and wait until the loop has inserted it and its
    /// presence is recorded. A client already registered under the same id
    /// is superseded.
    ///
    /// [`HubError::Presence`] means the client is registered but its
    /// presence could not be persisted.
    pub async fn register(&self, client: Client) -> Result<ClientHandle, HubError> {
        let handle = client.handle().clone();
        let (presence, stored) = oneshot::channel();
        if let Err(mpsc::error::SendError(cmd)) = self
            .inner
            .register_tx
            .send(RegisterCmd { client, presence })
            .await
        {
            cmd.client.close(CloseReason::Shutdown);
            return Err(HubError::Stopped);
        }
        let stored = stored.await.map_err(|_| HubError::Stopped)?;

        tracing::info!(
            client_id = %handle.id(),
            transport = handle.kind().as_str(),
            "Client registered"
        );
        stored.map_err(|source| HubError::Presence {
            client_id: handle.id().to_string(),
            source,
        })?;
        Ok(handle)
    }

    /// Remove the connection `seq` registered under `id`. Returns `false`
    /// when it is already gone or has been replaced by a newer connection.
    pub async fn unregister(&self, id: &str, seq: u64) -> Result<bool, HubError> {
        let (ack, done) = oneshot::channel();
        let (presence, stored) = oneshot::channel();
        self.inner
            .unregister_tx
            .send(UnregisterCmd {
                id: id.to_string(),
                seq,
                ack,
                presence,
            })
            .await
            .map_err(|_| HubError::Stopped)?;
        let removed = done.await.map_err(|_| HubError::Stopped)?;
        if !removed {
            return Ok(false);
        }

        tracing::info!(client_id = %id, "Client unregistered");
        match stored.await {
            Ok(Err(source)) => Err(HubError::Presence {
                client_id: id.to_string(),
                source,
            }),
            // Presence task gone means the hub is stopping; the removal stands.
            Ok(Ok(())) | Err(_) => Ok(true),
        }
    }

    /// Queue a message for delivery across the fleet without waiting.
    pub fn push_message(&self, msg: Message) -> Result<(), PushError> {
        msg.validate()?;
        let routed = Routed {
            msg,
            scope: Scope::Fleet,
        };
        match self.inner.broadcast_tx.try_send(routed) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(routed)) => {
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = %routed.msg.kind, "Broadcast queue full, dropping message");
                Err(PushError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Stopped),
        }
    }

    /// Deliver to local clients only, waiting for queue space.
    pub async fn deliver_local(&self, msg: Message) -> Result<(), PushError> {
        msg.validate()?;
        self.inner
            .broadcast_tx
            .send(Routed {
                msg,
                scope: Scope::Local,
            })
            .await
            .map_err(|_| PushError::Stopped)
    }

    pub fn is_local(&self, id: &str) -> bool {
        self.inner.index.contains_key(id)
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Whether presence changes are announced to local clients.
    pub fn announces_presence(&self) -> bool {
        self.inner.announce
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        let stats = &self.inner.stats;
        HubStatsSnapshot {
            clients: self.inner.index.len(),
            rooms: stats.rooms.load(Ordering::Relaxed),
            routed: stats.routed.load(Ordering::Relaxed),
            delivered: stats.delivered.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            evicted: stats.evicted.load(Ordering::Relaxed),
        }
    }
}

struct HubLoop {
    registry: Registry,
    register_rx: mpsc::Receiver<RegisterCmd>,
    unregister_rx: mpsc::Receiver<UnregisterCmd>,
    broadcast_rx: mpsc::Receiver<Routed>,
    presence_tx: mpsc::UnboundedSender<PresenceEvent>,
    producer: Option<SyncProducer>,
}

impl HubLoop {
    async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Hub loop started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(cmd) = self.register_rx.recv() => self.on_register(cmd),
                Some(cmd) = self.unregister_rx.recv() => self.on_unregister(cmd),
                Some(routed) = self.broadcast_rx.recv() => self.on_broadcast(routed),
                else => break,
            }
        }

        let clients = self.registry.drain();
        tracing::info!(clients = clients.len(), "Hub loop stopping, closing clients");
        for client in clients {
            self.departed(client.id(), None);
            client.close(CloseReason::Shutdown);
        }
    }

    /// Presence events leave the loop in registry order, so a departure is
    /// always recorded before a later arrival under the same id.
    fn arrived(&self, id: &str, reply: Option<PresenceReply>) {
        let _ = self.presence_tx.send(PresenceEvent::Arrived {
            id: id.to_string(),
            reply,
        });
    }

    fn departed(&self, id: &str, reply: Option<PresenceReply>) {
        let _ = self.presence_tx.send(PresenceEvent::Departed {
            id: id.to_string(),
            reply,
        });
    }

    fn on_register(&mut self, cmd: RegisterCmd) {
        let id = cmd.client.id().to_string();
        if let Some(previous) = self.registry.insert(cmd.client) {
            tracing::info!(
                client_id = %previous.id(),
                seq = previous.handle().seq(),
                "Superseding existing connection"
            );
            previous.close(CloseReason::Superseded);
        }
        self.arrived(&id, Some(cmd.presence));
    }

    fn on_unregister(&mut self, cmd: UnregisterCmd) {
        let removed = match self.registry.remove(&cmd.id, Some(cmd.seq)) {
            Some(client) => {
                client.close(CloseReason::Normal);
                self.departed(&cmd.id, Some(cmd.presence));
                true
            }
            None => false,
        };
        let _ = cmd.ack.send(removed);
    }

    fn on_broadcast(&mut self, routed: Routed) {
        let report = self.registry.route(&routed.msg);
        for handle in report.evicted {
            self.departed(handle.id(), None);
        }
        if routed.scope == Scope::Fleet {
            if let Some(producer) = &self.producer {
                producer.publish_message(&routed.msg);
            }
        }
    }
}

async fn run_presence(mut rx: mpsc::UnboundedReceiver<PresenceEvent>, hooks: PresenceHooks) {
    while let Some(event) = rx.recv().await {
        let (id, reply, stored) = match event {
            PresenceEvent::Arrived { id, reply } => {
                let stored = hooks.arrived(&id).await;
                (id, reply, stored)
            }
            PresenceEvent::Departed { id, reply } => {
                let stored = hooks.departed(&id).await;
                (id, reply, stored)
            }
        };
        match reply {
            Some(reply) => {
                let _ = reply.send(stored);
            }
            None => {
                if let Err(e) = stored {
                    tracing::warn!(client_id = %id, error = %e, "Failed to record departure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{MemoryPresenceStore, PresenceStatus, PresenceStore};
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    fn quiet_config() -> HubConfig {
        HubConfig {
            broadcast_capacity: 16,
            announce_presence: false,
        }
    }

    fn spawn_hub(config: &HubConfig) -> (Hub, CancellationToken) {
        let shutdown = CancellationToken::new();
        let (hub, _task) = Hub::spawn(
            config,
            new_local_index(),
            "instance-test",
            None,
            None,
            shutdown.clone(),
        );
        (hub, shutdown)
    }

    async fn recv_message(rx: &mut mpsc::Receiver<Bytes>) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("queue open");
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_register_is_visible_once_acknowledged() {
        let (hub, _shutdown) = spawn_hub(&quiet_config());
        let (client, _rx) = Client::socket("a", Some("r1".into()), 4);
        hub.register(client).await.unwrap();
        assert!(hub.is_local("a"));
        assert_eq!(hub.stats().clients, 1);
        assert_eq!(hub.stats().rooms, 1);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let (hub, _shutdown) = spawn_hub(&quiet_config());
        let (client, mut rx) = Client::socket("a", None, 4);
        let handle = hub.register(client).await.unwrap();

        assert!(hub.unregister("a", handle.seq()).await.unwrap());
        assert!(!hub.unregister("a", handle.seq()).await.unwrap());
        assert!(!hub.is_local("a"));
        assert!(handle.is_closed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_supersedes() {
        let (hub, _shutdown) = spawn_hub(&quiet_config());
        let (old, _old_rx) = Client::socket("dup", None, 4);
        let old_handle = hub.register(old).await.unwrap();
        let (new, mut new_rx) = Client::socket("dup", None, 4);
        let new_handle = hub.register(new).await.unwrap();

        assert!(old_handle.is_closed());
        assert_eq!(old_handle.close_reason(), CloseReason::Superseded);

        // The stale connection cannot remove its replacement.
        assert!(!hub.unregister("dup", old_handle.seq()).await.unwrap());

        hub.push_message(Message::new("m", json!(1)).to_client("dup")).unwrap();
        assert_eq!(recv_message(&mut new_rx).await.payload, json!(1));
        assert!(!new_handle.is_closed());
    }

    #[tokio::test]
    async fn test_push_rejects_ambiguous_target() {
        let (hub, _shutdown) = spawn_hub(&quiet_config());
        let mut msg = Message::new("m", json!(1));
        msg.to = Some("a".into());
        msg.room = Some("r".into());
        assert!(matches!(hub.push_message(msg), Err(PushError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_room_delivery_through_the_loop() {
        let (hub, _shutdown) = spawn_hub(&quiet_config());
        let (a, mut ra) = Client::socket("A", Some("r1".into()), 4);
        let (b, mut rb) = Client::socket("B", Some("r1".into()), 4);
        let (c, mut rc) = Client::socket("C", None, 4);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.register(c).await.unwrap();

        hub.push_message(Message::new("m", json!("hi")).to_room("r1")).unwrap();
        assert_eq!(recv_message(&mut ra).await.payload, json!("hi"));
        assert_eq!(recv_message(&mut rb).await.payload, json!("hi"));

        // Sentinel unicast proves the room message was not queued for C.
        hub.push_message(Message::new("sentinel", json!(0)).to_client("C")).unwrap();
        assert_eq!(recv_message(&mut rc).await.kind, "sentinel");
    }

    #[tokio::test]
    async fn test_presence_recorded_and_announced() {
        let store = Arc::new(MemoryPresenceStore::new());
        let index = new_local_index();
        let tracker = PresenceTracker::new(store.clone(), index.clone(), "instance-test", None);
        let shutdown = CancellationToken::new();
        let (hub, _task) = Hub::spawn(
            &HubConfig::default(),
            index,
            "instance-test",
            Some(tracker),
            None,
            shutdown.clone(),
        );

        let (watcher, mut watcher_rx) = Client::socket("watcher", None, 16);
        hub.register(watcher).await.unwrap();
        let (user, _user_rx) = Client::socket("u1", None, 16);
        let handle = hub.register(user).await.unwrap();

        let rec = store.get_status("u1").await.unwrap().unwrap();
        assert_eq!(rec.status, PresenceStatus::Online);
        assert_eq!(rec.instance_id, "instance-test");

        hub.unregister("u1", handle.seq()).await.unwrap();
        let rec = store.get_status("u1").await.unwrap().unwrap();
        assert_eq!(rec.status, PresenceStatus::Offline);

        let mut statuses = Vec::new();
        while statuses.len() < 2 {
            let msg = recv_message(&mut watcher_rx).await;
            if msg.kind == crate::presence::PRESENCE_MESSAGE_TYPE && msg.payload["user_id"] == "u1" {
                statuses.push(msg.payload["status"].as_str().unwrap_or_default().to_string());
            }
        }
        assert_eq!(statuses, vec!["online", "offline"]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_eviction_marks_offline() {
        let store = Arc::new(MemoryPresenceStore::new());
        let index = new_local_index();
        let tracker = PresenceTracker::new(store.clone(), index.clone(), "instance-test", None);
        let (hub, _task) = Hub::spawn(
            &quiet_config(),
            index,
            "instance-test",
            Some(tracker),
            None,
            CancellationToken::new(),
        );

        let (slow, _slow_rx) = Client::socket("slow", None, 1);
        let handle = hub.register(slow).await.unwrap();
        for i in 0..2 {
            hub.push_message(Message::new("m", json!(i)).to_client("slow")).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), handle.cancelled())
            .await
            .unwrap();
        assert_eq!(handle.close_reason(), CloseReason::SlowConsumer);

        let mut offline = false;
        for _ in 0..50 {
            if let Some(rec) = store.get_status("slow").await.unwrap() {
                if rec.status == PresenceStatus::Offline {
                    offline = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(offline);
        assert_eq!(hub.stats().evicted, 1);
    }

    /// Delays offline writes so a stale departure would land last.
    struct SlowOfflineStore {
        inner: MemoryPresenceStore,
    }

    #[async_trait::async_trait]
    impl PresenceStore for SlowOfflineStore {
        async fn set_status(&self, record: &PresenceRecord) -> Result<(), StoreError> {
            if !record.is_online() {
                tokio::time::sleep(Duration::from_millis(200)).await;
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
    async fn test_reconnect_after_eviction_stays_online() {
        let store = Arc::new(SlowOfflineStore {
            inner: MemoryPresenceStore::new(),
        });
        let index = new_local_index();
        let tracker = PresenceTracker::new(store.clone(), index.clone(), "instance-test", None);
        let (hub, _task) = Hub::spawn(
            &quiet_config(),
            index,
            "instance-test",
            Some(tracker),
            None,
            CancellationToken::new(),
        );

        let (slow, _slow_rx) = Client::socket("u", None, 1);
        let handle = hub.register(slow).await.unwrap();
        for i in 0..2 {
            hub.push_message(Message::new("m", json!(i)).to_client("u")).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), handle.cancelled())
            .await
            .unwrap();

        let (again, _again_rx) = Client::socket("u", None, 4);
        hub.register(again).await.unwrap();
        let rec = store.get_status("u").await.unwrap().unwrap();
        assert_eq!(rec.status, PresenceStatus::Online);

        // Nothing left in flight may flip it back.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(hub.is_local("u"));
        let rec = store.get_status("u").await.unwrap().unwrap();
        assert_eq!(rec.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let shutdown = CancellationToken::new();
        let (hub, task) = Hub::spawn(
            &quiet_config(),
            new_local_index(),
            "instance-test",
            None,
            None,
            shutdown.clone(),
        );
        let (client, _rx) = Client::socket("a", None, 4);
        let handle = hub.register(client).await.unwrap();

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(handle.close_reason(), CloseReason::Shutdown);
        let (late, _late_rx) = Client::socket("b", None, 4);
        assert!(matches!(hub.register(late).await, Err(HubError::Stopped)));
    }
}
