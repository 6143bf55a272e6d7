pub mod migrations;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared SQLite connection. rusqlite is synchronous, so every access goes
/// through [`with_conn`] on the blocking pool.
pub type DbPool = Arc<Mutex<Connection>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Create the data directory if needed, open (or create) the database file,
/// enable WAL mode and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, StoreError> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("push-hub.db");
    let mut conn = Connection::open(&db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    migrations::migrations().to_latest(&mut conn)?;

    tracing::info!(path = %db_path.display(), "Database initialized");

    Ok(Arc::new(Mutex::new(conn)))
}

/// Migrated in-memory database.
pub fn open_in_memory() -> Result<DbPool, StoreError> {
    let mut conn = Connection::open_in_memory()?;
    migrations::migrations().to_latest(&mut conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Run `f` against the connection on the blocking pool.
pub async fn with_conn<T, F>(db: &DbPool, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn).map_err(StoreError::from)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations::migrations().validate().is_ok());
    }

    #[test]
    fn test_init_db_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested");
        init_db(data_dir.to_str().unwrap()).unwrap();
        assert!(data_dir.join("push-hub.db").exists());
    }

    #[tokio::test]
    async fn test_with_conn_runs_query() {
        let db = open_in_memory().unwrap();
        let tables: i64 = with_conn(&db, |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('presence', 'messages', 'room_members')",
                [],
                |row| row.get(0),
            )
        })
        .await
        .unwrap();
        assert_eq!(tables, 3);
    }
}
