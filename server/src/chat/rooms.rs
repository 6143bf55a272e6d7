//! Room membership lookups used to admit clients into rooms.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;

use crate::db::{with_conn, DbPool, StoreError};

#[async_trait]
pub trait RoomMembership: Send + Sync {
    async fn members(&self, room: &str) -> Result<Vec<String>, StoreError>;

    async fn is_member(&self, room: &str, user_id: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryRoomMembership {
    rooms: DashMap<String, BTreeSet<String>>,
}

impl MemoryRoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room: &str, user_id: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(user_id.to_string());
    }
}

#[async_trait]
impl RoomMembership for MemoryRoomMembership {
    async fn members(&self, room: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_member(&self, room: &str, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.rooms.get(room).is_some_and(|m| m.contains(user_id)))
    }
}

/// `room_members` table in the shared SQLite database.
#[derive(Clone)]
pub struct SqliteRoomMembership {
    db: DbPool,
}

impl SqliteRoomMembership {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RoomMembership for SqliteRoomMembership {
    async fn members(&self, room: &str) -> Result<Vec<String>, StoreError> {
        let room = room.to_string();
        with_conn(&self.db, move |conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM room_members WHERE room = ?1 ORDER BY user_id")?;
            let rows = stmt.query_map(rusqlite::params![room], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn is_member(&self, room: &str, user_id: &str) -> Result<bool, StoreError> {
        let (room, user_id) = (room.to_string(), user_id.to_string());
        with_conn(&self.db, move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM room_members WHERE room = ?1 AND user_id = ?2",
                rusqlite::params![room, user_id],
                |row| row.get::<_, i64>(0).map(|c| c > 0),
            )
        })
        .await
    }
}

/// Whether `user_id` may join `room`. Lookup failures deny admission.
pub async fn admit(rooms: &dyn RoomMembership, enforce: bool, room: Option<&str>, user_id: &str) -> bool {
    let room = match room {
        Some(room) if enforce => room,
        _ => return true,
    };
    match rooms.is_member(room, user_id).await {
        Ok(member) => member,
        Err(e) => {
            tracing::warn!(room = %room, user_id = %user_id, error = %e, "Room membership lookup failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    #[tokio::test]
    async fn test_admission_rules() {
        let rooms = MemoryRoomMembership::new();
        rooms.join("r1", "alice");

        assert!(admit(&rooms, false, Some("r1"), "mallory").await);
        assert!(admit(&rooms, true, None, "mallory").await);
        assert!(admit(&rooms, true, Some("r1"), "alice").await);
        assert!(!admit(&rooms, true, Some("r1"), "mallory").await);
        assert!(!admit(&rooms, true, Some("r2"), "alice").await);
    }

    #[tokio::test]
    async fn test_sqlite_membership() {
        let db = open_in_memory().unwrap();
        with_conn(&db, |conn| {
            conn.execute_batch(
                "INSERT INTO room_members (room, user_id, joined_at) VALUES
                    ('r1', 'bob', 1), ('r1', 'alice', 2), ('r2', 'carol', 3);",
            )
        })
        .await
        .unwrap();
        let rooms = SqliteRoomMembership::new(db);

        assert_eq!(rooms.members("r1").await.unwrap(), vec!["alice", "bob"]);
        assert!(rooms.is_member("r1", "bob").await.unwrap());
        assert!(!rooms.is_member("r2", "bob").await.unwrap());
    }
}
