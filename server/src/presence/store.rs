use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::OptionalExtension;

use super::{PresenceRecord, PresenceStatus};
use crate::db::{with_conn, DbPool, StoreError};

/// Shared presence storage. Writes are idempotent overwrites keyed by user.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_status(&self, record: &PresenceRecord) -> Result<(), StoreError>;

    async fn get_status(&self, user_id: &str) -> Result<Option<PresenceRecord>, StoreError>;

    /// All users currently marked online, on any instance.
    async fn online_users(&self) -> Result<Vec<PresenceRecord>, StoreError>;
}

/// Process-local presence store.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    records: DashMap<String, PresenceRecord>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_status(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        self.records.insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn get_status(&self, user_id: &str) -> Result<Option<PresenceRecord>, StoreError> {
        Ok(self.records.get(user_id).map(|r| r.value().clone()))
    }

    async fn online_users(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        let mut online: Vec<PresenceRecord> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_online())
            .map(|entry| entry.value().clone())
            .collect();
        online.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(online)
    }
}

/// Presence table in the shared SQLite database.
#[derive(Clone)]
pub struct SqlitePresenceStore {
    db: DbPool,
}

impl SqlitePresenceStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PresenceRecord> {
    let status: String = row.get(1)?;
    Ok(PresenceRecord {
        user_id: row.get(0)?,
        status: PresenceStatus::from_str(&status).unwrap_or(PresenceStatus::Offline),
        instance_id: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

#[async_trait]
impl PresenceStore for SqlitePresenceStore {
    async fn set_status(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let record = record.clone();
        with_conn(&self.db, move |conn| {
            conn.execute(
                "INSERT INTO presence (user_id, status, instance_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                     status = excluded.status,
                     instance_id = excluded.instance_id,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    record.user_id,
                    record.status.as_str(),
                    record.instance_id,
                    record.updated_at,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_status(&self, user_id: &str) -> Result<Option<PresenceRecord>, StoreError> {
        let user_id = user_id.to_string();
        with_conn(&self.db, move |conn| {
            conn.query_row(
                "SELECT user_id, status, instance_id, updated_at FROM presence WHERE user_id = ?1",
                rusqlite::params![user_id],
                record_from_row,
            )
            .optional()
        })
        .await
    }

    async fn online_users(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        with_conn(&self.db, |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, status, instance_id, updated_at FROM presence
                 WHERE status = 'online' ORDER BY user_id",
            )?;
            let rows = stmt.query_map([], record_from_row)?;
            rows.collect()
        })
        .await
    }
}
