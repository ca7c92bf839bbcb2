//! Initial schema: users, groups, membership, messages, bans, files.

use rusqlite::Connection;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            username      TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_admin      INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS groups (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            name       TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memberships (
            group_id  INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            user_id   INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            joined_at TEXT NOT NULL,
            PRIMARY KEY (group_id, user_id)
        );

        -- seq is the global insertion order; per-sender ordering within a
        -- group is verifiable by comparing seq values.
        CREATE TABLE IF NOT EXISTS messages (
            seq       INTEGER PRIMARY KEY AUTOINCREMENT,
            id        TEXT NOT NULL UNIQUE,
            group_id  INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            sender_id INTEGER NOT NULL REFERENCES users(id),
            content   TEXT NOT NULL,
            sent_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_group ON messages(group_id, seq);

        CREATE TABLE IF NOT EXISTS bans (
            subject_type TEXT NOT NULL CHECK (subject_type IN ('user', 'group')),
            subject_id   INTEGER NOT NULL,
            created_at   TEXT NOT NULL,
            PRIMARY KEY (subject_type, subject_id)
        );

        CREATE TABLE IF NOT EXISTS files (
            id          TEXT PRIMARY KEY,
            group_id    INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            uploader_id INTEGER NOT NULL REFERENCES users(id),
            file_name   TEXT NOT NULL,
            size_bytes  INTEGER NOT NULL,
            blake3_hex  TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        ",
    )
}
