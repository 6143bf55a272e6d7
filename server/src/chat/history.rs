//! Message history: storage and the paginated read endpoint.

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;

use crate::db::{with_conn, DbPool, StoreError};
use crate::hub::message::Message;
use crate::state::AppState;

/// Which conversation to read. With neither `room` nor `to` set, global
/// broadcasts are returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub room: Option<String>,
    pub to: Option<String>,
    /// Only messages with an id below this one.
    pub before: Option<i64>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    #[serde(flatten)]
    pub message: Message,
}

/// Persistent message log. `history` returns messages oldest first.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store(&self, msg: &Message) -> Result<i64, StoreError>;

    async fn history(&self, filter: &HistoryFilter) -> Result<Vec<StoredMessage>, StoreError>;
}

fn in_conversation(filter: &HistoryFilter, msg: &Message) -> bool {
    match (&filter.room, &filter.to) {
        (Some(room), _) => msg.room.as_ref() == Some(room),
        (None, Some(to)) => msg.to.as_ref() == Some(to),
        (None, None) => msg.room.is_none() && msg.to.is_none(),
    }
}

#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, msg: &Message) -> Result<i64, StoreError> {
        let mut messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        let id = messages.len() as i64 + 1;
        messages.push(StoredMessage {
            id,
            message: msg.clone(),
        });
        Ok(id)
    }

    async fn history(&self, filter: &HistoryFilter) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        let mut page: Vec<StoredMessage> = messages
            .iter()
            .rev()
            .filter(|m| filter.before.map_or(true, |before| m.id < before))
            .filter(|m| in_conversation(filter, &m.message))
            .take(filter.limit)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }
}

/// `messages` table in the shared SQLite database.
#[derive(Clone)]
pub struct SqliteMessageStore {
    db: DbPool,
}

impl SqliteMessageStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn store(&self, msg: &Message) -> Result<i64, StoreError> {
        let msg = msg.clone();
        with_conn(&self.db, move |conn| {
            conn.execute(
                "INSERT INTO messages (kind, sender, recipient, room, payload, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    msg.kind,
                    msg.from,
                    msg.to,
                    msg.room,
                    msg.payload.to_string(),
                    msg.ts,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn history(&self, filter: &HistoryFilter) -> Result<Vec<StoredMessage>, StoreError> {
        let filter = filter.clone();
        with_conn(&self.db, move |conn| {
            let before = filter.before.unwrap_or(i64::MAX);
            let limit = filter.limit as i64;
            let (sql, target) = match (&filter.room, &filter.to) {
                (Some(room), _) => (
                    "SELECT id, kind, sender, recipient, room, payload, ts FROM messages
                     WHERE room = ?1 AND id < ?2 ORDER BY id DESC LIMIT ?3",
                    Some(room.clone()),
                ),
                (None, Some(to)) => (
                    "SELECT id, kind, sender, recipient, room, payload, ts FROM messages
                     WHERE recipient = ?1 AND id < ?2 ORDER BY id DESC LIMIT ?3",
                    Some(to.clone()),
                ),
                (None, None) => (
                    "SELECT id, kind, sender, recipient, room, payload, ts FROM messages
                     WHERE room IS NULL AND recipient IS NULL AND id < ?2
                     ORDER BY id DESC LIMIT ?3",
                    None,
                ),
            };

            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(rusqlite::params![target, before, limit], |row| {
                let payload: String = row.get(5)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    message: Message {
                        kind: row.get(1)?,
                        from: row.get(2)?,
                        to: row.get(3)?,
                        room: row.get(4)?,
                        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                        ts: row.get(6)?,
                    },
                })
            })?;
            let mut page = rows.collect::<Result<Vec<_>, _>>()?;
            page.reverse();
            Ok(page)
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub room: Option<String>,
    pub to: Option<String>,
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
}

/// GET /api/messages?room=&to=&before=&limit=
pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, (StatusCode, Json<Value>)> {
    let room = params.room.filter(|r| !r.is_empty());
    let to = params.to.filter(|t| !t.is_empty());
    if room.is_some() && to.is_some() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "give either room or to, not both"})),
        ));
    }

    let settings = &state.config.history;
    let limit = params
        .limit
        .unwrap_or(settings.default_limit)
        .clamp(1, settings.max_limit.max(1)) as usize;

    // One extra row tells whether an older page exists.
    let filter = HistoryFilter {
        room,
        to,
        before: params.before,
        limit: limit + 1,
    };
    let mut messages = state.messages.history(&filter).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to load message history");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "history unavailable"})),
        )
    })?;

    let has_more = messages.len() > limit;
    if has_more {
        messages.remove(0);
    }
    Ok(Json(HistoryResponse { messages, has_more }))
}
