use rusqlite::Connection;
use tracing::info;

use crate::Result;

/// Timestamps are integer microseconds since the Unix epoch.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS threads (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS thread_members (
            thread_id   TEXT NOT NULL REFERENCES threads(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (thread_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            peer_kind       TEXT NOT NULL CHECK (peer_kind IN ('user', 'thread')),
            peer_id         TEXT NOT NULL,
            author_id       TEXT NOT NULL REFERENCES users(id),
            body            TEXT NOT NULL,
            sent_at         INTEGER NOT NULL,
            scheduled_id    TEXT UNIQUE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_peer
            ON messages(peer_kind, peer_id, sent_at);

        CREATE TABLE IF NOT EXISTS conversation_settings (
            user_id         TEXT NOT NULL,
            peer_kind       TEXT NOT NULL CHECK (peer_kind IN ('user', 'thread')),
            peer_id         TEXT NOT NULL,
            mode            INTEGER NOT NULL,
            silent          INTEGER NOT NULL,
            important_only  INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            PRIMARY KEY (user_id, peer_kind, peer_id)
        );

        CREATE TABLE IF NOT EXISTS scheduled_messages (
            id              TEXT PRIMARY KEY,
            author_id       TEXT NOT NULL,
            peer_kind       TEXT NOT NULL CHECK (peer_kind IN ('user', 'thread')),
            peer_id         TEXT NOT NULL,
            body            TEXT NOT NULL,
            scheduled_at    INTEGER NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'sent', 'failed', 'cancelled')),
            sent_at         INTEGER,
            message_id      TEXT,
            failure_reason  TEXT,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_scheduled_due
            ON scheduled_messages(status, scheduled_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
