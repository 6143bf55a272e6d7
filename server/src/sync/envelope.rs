//! Envelope published to the distributed log for cross-instance fan-out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hub::message::{now_secs, Message, Target};
use crate::presence::PresenceRecord;

/// Event classes carried on the log. Each class maps to its own topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    User,
    Room,
    System,
    Presence,
}

impl EventClass {
    pub const ALL: [EventClass; 4] = [Self::User, Self::Room, Self::System, Self::Presence];

    /// Envelope `type` for this class.
    pub fn envelope_type(&self) -> &'static str {
        match self {
            Self::User => "user_message",
            Self::Room => "room_message",
            Self::System => "system_message",
            Self::Presence => "status_update",
        }
    }

    pub fn from_envelope_type(kind: &str) -> Option<Self> {
        match kind {
            "user_message" => Some(Self::User),
            "room_message" => Some(Self::Room),
            "system_message" => Some(Self::System),
            "status_update" => Some(Self::Presence),
            _ => None,
        }
    }

    pub fn for_message(msg: &Message) -> Self {
        match msg.target() {
            Target::Client(_) => Self::User,
            Target::Room(_) => Self::Room,
            Target::Everyone => Self::System,
        }
    }
}

/// `{type, source_id, timestamp, content}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub source_id: String,
    pub timestamp: i64,
    pub content: Value,
}

impl SyncEnvelope {
    pub fn new(class: EventClass, source_id: &str, content: Value) -> Self {
        Self {
            kind: class.envelope_type().to_string(),
            source_id: source_id.to_string(),
            timestamp: now_secs(),
            content,
        }
    }

    pub fn for_message(source_id: &str, msg: &Message) -> Result<(EventClass, Self), serde_json::Error> {
        let class = EventClass::for_message(msg);
        Ok((class, Self::new(class, source_id, serde_json::to_value(msg)?)))
    }

    pub fn for_presence(source_id: &str, record: &PresenceRecord) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            EventClass::Presence,
            source_id,
            serde_json::to_value(record)?,
        ))
    }

    pub fn class(&self) -> Option<EventClass> {
        EventClass::from_envelope_type(&self.kind)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Whether this instance produced the envelope.
    pub fn is_from(&self, instance_id: &str) -> bool {
        self.source_id == instance_id
    }
}

/// Partition key for a message: the target id, or `"system"` for broadcasts.
pub fn partition_key(msg: &Message) -> String {
    match msg.target() {
        Target::Client(id) => id.to_string(),
        Target::Room(room) => room.to_string(),
        Target::Everyone => "system".to_string(),
    }
}
