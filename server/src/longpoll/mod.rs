//! Long-poll fallback transport.
//!
//! Each waiting HTTP request owns a single-slot channel. The hub routes into
//! it like any other client queue, and `POST /send` can drop a raw body into
//! it directly through the [`LongPollRegistry`].

pub mod handler;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::hub::client::{ClientHandle, ClientId, CloseReason};

/// Long-poll settings. Exposed in `push-hub.toml` under the `[longpoll]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPollConfig {
    /// Seconds a poll waits before answering with no data (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

impl LongPollConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered(Bytes),
    NoData,
    Canceled,
    /// A newer poll for the same id took over.
    Superseded,
}

struct Slot {
    ticket: u64,
    tx: mpsc::Sender<Bytes>,
}

/// A waiter's end of its slot.
pub struct Subscription {
    pub ticket: u64,
    pub rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
}

impl Subscription {
    /// Sender for the same slot, handed to the hub as the client's queue.
    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }
}

/// Waiting long-poll clients, keyed by client id.
#[derive(Clone, Default)]
pub struct LongPollRegistry {
    slots: Arc<DashMap<ClientId, Slot>>,
    next_ticket: Arc<AtomicU64>,
}

impl LongPollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `id`, replacing any slot a previous waiter held.
    pub fn subscribe(&self, id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(
            id.to_string(),
            Slot {
                ticket,
                tx: tx.clone(),
            },
        );
        Subscription { ticket, rx, tx }
    }

    /// Hand `data` to the waiter for `id`. Returns `false` when nobody is
    /// waiting or the slot is already filled.
    pub fn send(&self, id: &str, data: Bytes) -> bool {
        match self.slots.remove(id) {
            Some((_, slot)) => slot.tx.try_send(data).is_ok(),
            None => false,
        }
    }

    /// Drop the slot for `id` if it still belongs to `ticket`.
    pub fn release(&self, id: &str, ticket: u64) {
        self.slots.remove_if(id, |_, slot| slot.ticket == ticket);
    }

    pub fn is_waiting(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Wait for a frame, cancellation of the client or the timeout, whichever
/// comes first. A frame already in the slot wins over a cancellation.
pub async fn wait(rx: &mut mpsc::Receiver<Bytes>, handle: &ClientHandle, timeout: Duration) -> PollOutcome {
    tokio::select! {
        biased;
        frame = rx.recv() => match frame {
            Some(frame) => PollOutcome::Delivered(frame),
            None => PollOutcome::Canceled,
        },
        _ = handle.cancelled() => match handle.close_reason() {
            CloseReason::Superseded => PollOutcome::Superseded,
            _ => PollOutcome::Canceled,
        },
        _ = tokio::time::sleep(timeout) => PollOutcome::NoData,
    }
}
