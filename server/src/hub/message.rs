//! The JSON message exchanged with clients and routed by the hub.
//!
//! Wire schema: `{type, from?, to?, room?, payload?, ts?}`. At most one of
//! `to` / `room` may be set; when both are absent the message is a global
//! broadcast. Empty strings are treated as absent.
//!
//! `ts` is Unix seconds. Zero is the "unset" value: a message decoded with
//! `ts` absent or `0` is stamped with the receive time, and a zero `ts` is
//! omitted when encoding. Timestamps at the epoch itself cannot be carried.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while decoding or validating a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message addresses both a client and a room")]
    AmbiguousTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Unix timestamp in seconds. Zero means "not set".
    #[serde(default, skip_serializing_if = "is_unset")]
    pub ts: i64,
}

fn is_unset(ts: &i64) -> bool {
    *ts == 0
}

/// Where a message should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Client(&'a str),
    Room(&'a str),
    Everyone,
}

impl Message {
    /// Create a global broadcast message stamped with the current time.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            from: None,
            to: None,
            room: None,
            payload,
            ts: now_secs(),
        }
    }

    pub fn from_client(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Address the message to a single client. Clears any room.
    pub fn to_client(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self.room = None;
        self
    }

    /// Address the message to a room. Clears any unicast target.
    pub fn to_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self.to = None;
        self
    }

    pub fn target(&self) -> Target<'_> {
        match (self.to.as_deref(), self.room.as_deref()) {
            (Some(to), _) => Target::Client(to),
            (None, Some(room)) => Target::Room(room),
            (None, None) => Target::Everyone,
        }
    }

    /// Decode a message received from a client or an upstream system.
    ///
    /// Empty addressing fields are normalized away, the target invariant is
    /// checked and a missing timestamp is populated with the receive time.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        let mut msg: Message = serde_json::from_slice(data)?;
        msg.normalize();
        msg.validate()?;
        msg.stamp();
        Ok(msg)
    }

    /// Same as [`Message::decode`], for a message already parsed as JSON.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let mut msg: Message = serde_json::from_value(value)?;
        msg.normalize();
        msg.validate()?;
        msg.stamp();
        Ok(msg)
    }

    pub fn encode(&self) -> Result<Bytes, MessageError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Map empty `from` / `to` / `room` to `None`.
    pub fn normalize(&mut self) {
        for field in [&mut self.from, &mut self.to, &mut self.room] {
            if field.as_deref().is_some_and(str::is_empty) {
                *field = None;
            }
        }
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        if self.to.is_some() && self.room.is_some() {
            return Err(MessageError::AmbiguousTarget);
        }
        Ok(())
    }

    /// Populate `ts` with the current time when unset.
    pub fn stamp(&mut self) {
        if self.ts == 0 {
            self.ts = now_secs();
        }
    }
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
