//! Client and room maps plus the routing pass.
//!
//! A `Registry` is owned by the hub loop task and is never shared. The
//! [`LocalIndex`] mirror is the only state other tasks can observe, and only
//! the registry writes to it.

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::client::{Client, ClientHandle, ClientId, CloseReason, EnqueueError};
use super::message::{Message, Target};

/// Read-only view of locally registered clients, keyed by client id.
pub type LocalIndex = Arc<DashMap<ClientId, LocalEntry>>;

pub fn new_local_index() -> LocalIndex {
    Arc::new(DashMap::new())
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalEntry {
    pub room: Option<String>,
    pub transport: &'static str,
    pub connected_at: i64,
}

/// Hub counters, updated by the loop and read by the stats endpoint.
#[derive(Debug, Default)]
pub struct HubStats {
    pub routed: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub evicted: AtomicU64,
    pub rooms: AtomicUsize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStatsSnapshot {
    pub clients: usize,
    pub rooms: usize,
    pub routed: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}

/// Result of one routing pass.
#[derive(Debug, Default)]
pub struct RouteReport {
    pub delivered: usize,
    /// Clients removed during the pass because their queue was full or gone.
    pub evicted: Vec<ClientHandle>,
}

pub struct Registry {
    clients: HashMap<ClientId, Client>,
    rooms: HashMap<String, HashSet<ClientId>>,
    index: LocalIndex,
    stats: Arc<HubStats>,
}

impl Registry {
    pub fn new(index: LocalIndex, stats: Arc<HubStats>) -> Self {
        Self {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            index,
            stats,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn room_members(&self, room: &str) -> Vec<ClientId> {
        self.rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Insert a client. A client already registered under the same id is
    /// detached and returned so the caller can close it.
    pub fn insert(&mut self, client: Client) -> Option<Client> {
        let id = client.id().to_string();
        let previous = self.detach(&id, None);

        if let Some(room) = client.room() {
            self.rooms
                .entry(room.to_string())
                .or_default()
                .insert(id.clone());
        }
        self.index.insert(
            id.clone(),
            LocalEntry {
                room: client.room().map(str::to_string),
                transport: client.kind().as_str(),
                connected_at: super::message::now_secs(),
            },
        );
        self.clients.insert(id, client);
        self.sync_room_gauge();
        previous
    }

    /// Remove a client from both maps. When `seq` is given, the client is
    /// removed only if it is that exact connection.
    pub fn remove(&mut self, id: &str, seq: Option<u64>) -> Option<Client> {
        let removed = self.detach(id, seq);
        self.sync_room_gauge();
        removed
    }

    fn detach(&mut self, id: &str, seq: Option<u64>) -> Option<Client> {
        let matches = match (self.clients.get(id), seq) {
            (Some(client), Some(seq)) => client.handle().seq() == seq,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return None;
        }

        let client = self.clients.remove(id)?;
        if let Some(room) = client.room() {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        self.index.remove(id);
        Some(client)
    }

    fn sync_room_gauge(&self) {
        self.stats.rooms.store(self.rooms.len(), Ordering::Relaxed);
    }

    /// Remove and return every client, used on shutdown.
    pub fn drain(&mut self) -> Vec<Client> {
        self.rooms.clear();
        self.index.clear();
        self.sync_room_gauge();
        self.clients.drain().map(|(_, c)| c).collect()
    }

    /// Deliver `msg` to its recipients.
    ///
    /// The message is encoded once. Each send is non-blocking; a recipient
    /// whose queue is full (or already closed) is evicted within this pass
    /// and closed with [`CloseReason::SlowConsumer`].
    pub fn route(&mut self, msg: &Message) -> RouteReport {
        let mut report = RouteReport::default();
        self.stats.routed.fetch_add(1, Ordering::Relaxed);

        let recipients: Vec<ClientId> = match msg.target() {
            Target::Client(id) => {
                if self.clients.contains_key(id) {
                    vec![id.to_string()]
                } else {
                    tracing::debug!(to = %id, "Unicast target not connected here");
                    Vec::new()
                }
            }
            Target::Room(room) => self.room_members(room),
            Target::Everyone => self.clients.keys().cloned().collect(),
        };
        if recipients.is_empty() {
            return report;
        }

        let frame: Bytes = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, kind = %msg.kind, "Failed to encode message, skipping");
                return report;
            }
        };

        for id in recipients {
            let Some(client) = self.clients.get(&id) else {
                continue;
            };
            match client.try_enqueue(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    tracing::warn!(
                        client_id = %id,
                        transport = client.kind().as_str(),
                        error = %err,
                        "Evicting client during routing"
                    );
                    if let Some(client) = self.remove(&id, None) {
                        let handle = client.handle().clone();
                        let reason = match err {
                            EnqueueError::Full => CloseReason::SlowConsumer,
                            EnqueueError::Closed => CloseReason::Normal,
                        };
                        client.close(reason);
                        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                        report.evicted.push(handle);
                    }
                }
            }
        }

        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn registry() -> Registry {
        Registry::new(new_local_index(), Arc::new(HubStats::default()))
    }

    fn socket(id: &str, room: Option<&str>, cap: usize) -> (Client, mpsc::Receiver<Bytes>) {
        Client::socket(id, room.map(str::to_string), cap)
    }

    #[test]
    fn test_unregister_removes_from_clients_and_rooms() {
        let mut reg = registry();
        let (a, _ra) = socket("a", Some("r1"), 4);
        reg.insert(a);
        assert_eq!(reg.room_members("r1"), vec!["a".to_string()]);

        assert!(reg.remove("a", None).is_some());
        assert!(!reg.contains("a"));
        assert!(reg.room_members("r1").is_empty());
        assert_eq!(reg.room_count(), 0);
        assert!(reg.index.is_empty());

        // Second unregister is a no-op.
        assert!(reg.remove("a", None).is_none());
    }

    #[test]
    fn test_stale_sequence_does_not_remove_replacement() {
        let mut reg = registry();
        let (old, _r1) = socket("dup", None, 4);
        let old_seq = old.handle().seq();
        reg.insert(old);
        let (new, _r2) = socket("dup", None, 4);
        let new_seq = new.handle().seq();
        let superseded = reg.insert(new).expect("old client returned");
        assert_eq!(superseded.handle().seq(), old_seq);

        assert!(reg.remove("dup", Some(old_seq)).is_none());
        assert!(reg.contains("dup"));
        assert!(reg.remove("dup", Some(new_seq)).is_some());
    }

    #[test]
    fn test_unicast_enqueues_exactly_one_item() {
        let mut reg = registry();
        let (x, mut rx) = socket("x", None, 4);
        let (y, mut ry) = socket("y", None, 4);
        reg.insert(x);
        reg.insert(y);

        let report = reg.route(&Message::new("m", json!(1)).to_client("x"));
        assert_eq!(report.delivered, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(ry.try_recv().is_err());
    }

    #[test]
    fn test_unicast_to_absent_client_is_silent() {
        let mut reg = registry();
        let (y, mut ry) = socket("y", None, 4);
        reg.insert(y);

        let report = reg.route(&Message::new("m", json!(1)).to_client("ghost"));
        assert_eq!(report.delivered, 0);
        assert!(report.evicted.is_empty());
        assert!(ry.try_recv().is_err());
        assert!(reg.contains("y"));
    }

    #[test]
    fn test_room_broadcast_reaches_members_only() {
        let mut reg = registry();
        let (a, mut ra) = socket("A", Some("r1"), 4);
        let (b, mut rb) = socket("B", Some("r1"), 4);
        let (c, mut rc) = socket("C", None, 4);
        reg.insert(a);
        reg.insert(b);
        reg.insert(c);

        let report = reg.route(&Message::new("m", json!("hi")).to_room("r1"));
        assert_eq!(report.delivered, 2);

        let got: Message = serde_json::from_slice(&ra.try_recv().unwrap()).unwrap();
        assert_eq!(got.payload, json!("hi"));
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_ok());
        assert!(rb.try_recv().is_err());
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn test_global_broadcast_reaches_everyone() {
        let mut reg = registry();
        let mut receivers = Vec::new();
        for id in ["a", "b", "c"] {
            let (client, rx) = socket(id, Some(id), 2);
            reg.insert(client);
            receivers.push(rx);
        }
        assert_eq!(reg.route(&Message::new("m", json!(null))).delivered, 3);
        for rx in &mut receivers {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[test]
    fn test_full_queue_evicts_within_the_pass() {
        let mut reg = registry();
        let (slow, _slow_rx) = socket("slow", Some("r"), 1);
        let slow_handle = slow.handle().clone();
        let (fast, mut fast_rx) = socket("fast", Some("r"), 8);
        reg.insert(slow);
        reg.insert(fast);

        let msg = Message::new("m", json!(1)).to_room("r");
        assert!(reg.route(&msg).evicted.is_empty());

        let report = reg.route(&msg);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].id(), "slow");
        assert!(!reg.contains("slow"));
        assert!(slow_handle.is_closed());
        assert_eq!(slow_handle.close_reason(), CloseReason::SlowConsumer);
        assert_eq!(reg.room_members("r"), vec!["fast".to_string()]);

        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn test_empty_room_is_reaped() {
        let mut reg = registry();
        let (a, _ra) = socket("a", Some("r"), 1);
        let (b, _rb) = socket("b", Some("r"), 1);
        reg.insert(a);
        reg.insert(b);
        assert_eq!(reg.room_count(), 1);
        reg.remove("a", None);
        assert_eq!(reg.room_count(), 1);
        reg.remove("b", None);
        assert_eq!(reg.room_count(), 0);
    }
}
