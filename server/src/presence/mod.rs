//! Fleet-wide presence tracking.
//!
//! The presence store is the shared source of truth; the hub's local index
//! is consulted first for users connected to this instance.

pub mod routes;
pub mod store;
pub mod tracker;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::hub::message::{now_secs, Message};

pub use store::{MemoryPresenceStore, PresenceStore, SqlitePresenceStore};
pub use tracker::PresenceTracker;

/// Message `type` used to announce presence changes to connected clients.
pub const PRESENCE_MESSAGE_TYPE: &str = "presence";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Presence of one user. `instance_id` is empty when offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    pub instance_id: String,
    pub updated_at: i64,
}

impl PresenceRecord {
    pub fn online(user_id: &str, instance_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: PresenceStatus::Online,
            instance_id: instance_id.to_string(),
            updated_at: now_secs(),
        }
    }

    pub fn offline(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            instance_id: String::new(),
            updated_at: now_secs(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }

    /// Broadcast message announcing this change to connected clients.
    pub fn announcement(&self) -> Message {
        Message::new(
            PRESENCE_MESSAGE_TYPE,
            json!({
                "user_id": self.user_id,
                "status": self.status.as_str(),
                "instance_id": self.instance_id,
            }),
        )
    }
}
