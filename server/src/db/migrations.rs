use rusqlite_migration::{Migrations, M};

/// Schema migrations, tracked through SQLite's `user_version` pragma.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: presence

CREATE TABLE presence (
    user_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    instance_id TEXT NOT NULL DEFAULT '',
    updated_at INTEGER NOT NULL
);

CREATE INDEX idx_presence_status ON presence(status);
",
        ),
        M::up(
            "-- Migration 2: message history and room membership

CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    sender TEXT,
    recipient TEXT,
    room TEXT,
    payload TEXT NOT NULL,
    ts INTEGER NOT NULL
);

CREATE INDEX idx_messages_room ON messages(room, id);
CREATE INDEX idx_messages_recipient ON messages(recipient, id);

CREATE TABLE room_members (
    room TEXT NOT NULL,
    user_id TEXT NOT NULL,
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (room, user_id)
);
",
        ),
    ])
}
