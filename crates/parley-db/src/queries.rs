use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use parley_types::models::{
    ChatMessage, NotificationMode, Peer, ScheduledMessage, ScheduledStatus, UserSettings,
};

use crate::models::SendRejection;
use crate::{Database, DbError, Result};

impl Database {
    // -- Users --

    /// Record a user seen on the gateway. Identity comes from the token, so
    /// the latest username wins.
    pub fn upsert_user(&self, id: Uuid, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username",
                params![id.to_string(), username, to_micros(&Utc::now())],
            )?;
            Ok(())
        })
    }

    // -- Threads --

    pub fn create_thread(&self, id: Uuid, name: &str, members: &[Uuid]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO threads (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), name, to_micros(&Utc::now())],
            )?;
            for member in members {
                tx.execute(
                    "INSERT OR IGNORE INTO thread_members (thread_id, user_id) VALUES (?1, ?2)",
                    params![id.to_string(), member.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn is_thread_member(&self, thread_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| query_is_member(conn, thread_id, user_id))
    }

    // -- Messages --

    /// Validate and store a live message.
    pub fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        self.with_conn(|conn| {
            validate_send(conn, message.author_id, &message.peer, &message.body)?;
            insert_message_row(conn, message, None)
        })
    }

    /// Most recent messages for a conversation, newest first.
    pub fn get_messages(&self, peer: &Peer, limit: u32) -> Result<Vec<ChatMessage>> {
        self.with_conn(|conn| query_messages(conn, peer, limit))
    }

    // -- Settings --

    pub fn upsert_settings(&self, user_id: Uuid, peer: &Peer, settings: &UserSettings) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversation_settings
                    (user_id, peer_kind, peer_id, mode, silent, important_only, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id, peer_kind, peer_id) DO UPDATE SET
                    mode = excluded.mode,
                    silent = excluded.silent,
                    important_only = excluded.important_only,
                    updated_at = excluded.updated_at",
                params![
                    user_id.to_string(),
                    peer.kind(),
                    peer.id().to_string(),
                    settings.mode.to_wire(),
                    settings.silent,
                    settings.important_only,
                    to_micros(&Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_settings(&self, user_id: Uuid, peer: &Peer) -> Result<Option<UserSettings>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT mode, silent, important_only FROM conversation_settings
                     WHERE user_id = ?1 AND peer_kind = ?2 AND peer_id = ?3",
                    params![user_id.to_string(), peer.kind(), peer.id().to_string()],
                    |row| {
                        Ok(UserSettings {
                            mode: stored_mode(row.get(0)?),
                            silent: row.get(1)?,
                            important_only: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    // -- Scheduled messages --

    pub fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledMessage>> {
        self.with_conn(|conn| query_scheduled(conn, id))
    }

    /// Failure reason recorded when an item moved to `failed`.
    pub fn get_failure_reason(&self, id: Uuid) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let reason = conn
                .query_row(
                    "SELECT failure_reason FROM scheduled_messages WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?;
            Ok(reason.flatten())
        })
    }
}

/// Checks shared by live and scheduled sends.
pub(crate) fn validate_send(conn: &Connection, author_id: Uuid, peer: &Peer, body: &str) -> Result<()> {
    if body.trim().is_empty() {
        return Err(SendRejection::EmptyBody.into());
    }
    if !query_user_exists(conn, author_id)? {
        return Err(SendRejection::UnknownAuthor.into());
    }
    match peer {
        Peer::User(recipient) => {
            if !query_user_exists(conn, *recipient)? {
                return Err(SendRejection::UnknownRecipient.into());
            }
        }
        Peer::Thread(thread_id) => {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM threads WHERE id = ?1)",
                [thread_id.to_string()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(SendRejection::UnknownThread.into());
            }
            if !query_is_member(conn, *thread_id, author_id)? {
                return Err(SendRejection::NotAMember.into());
            }
        }
    }
    Ok(())
}

pub(crate) fn insert_message_row(
    conn: &Connection,
    message: &ChatMessage,
    scheduled_id: Option<Uuid>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, peer_kind, peer_id, author_id, body, sent_at, scheduled_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            message.id.to_string(),
            message.peer.kind(),
            message.peer.id().to_string(),
            message.author_id.to_string(),
            message.body,
            to_micros(&message.sent_at),
            scheduled_id.map(|id| id.to_string()),
        ],
    )?;
    Ok(())
}

pub(crate) fn query_scheduled(conn: &Connection, id: Uuid) -> Result<Option<ScheduledMessage>> {
    let row = conn
        .query_row(
            "SELECT id, author_id, peer_kind, peer_id, body, scheduled_at, status, sent_at
             FROM scheduled_messages WHERE id = ?1",
            [id.to_string()],
            ScheduledRow::from_row,
        )
        .optional()?;

    row.map(ScheduledRow::into_domain).transpose()
}

/// Pending items due at `now`, oldest schedule first.
pub(crate) fn query_due_scheduled(
    conn: &Connection,
    now: &DateTime<Utc>,
    limit: usize,
) -> Result<Vec<ScheduledMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, author_id, peer_kind, peer_id, body, scheduled_at, status, sent_at
         FROM scheduled_messages
         WHERE status = 'pending' AND scheduled_at <= ?1
         ORDER BY scheduled_at ASC, created_at ASC, id ASC
         LIMIT ?2",
    )?;

    let rows = stmt
        .query_map(params![to_micros(now), limit as i64], ScheduledRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(ScheduledRow::into_domain).collect()
}

fn query_user_exists(conn: &Connection, id: Uuid) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
        [id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn query_is_member(conn: &Connection, thread_id: Uuid, user_id: Uuid) -> Result<bool> {
    let member = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM thread_members WHERE thread_id = ?1 AND user_id = ?2)",
        [thread_id.to_string(), user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(member)
}

fn query_messages(conn: &Connection, peer: &Peer, limit: u32) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, author_id, body, sent_at
         FROM messages
         WHERE peer_kind = ?1 AND peer_id = ?2
         ORDER BY sent_at DESC
         LIMIT ?3",
    )?;

    let rows = stmt
        .query_map(params![peer.kind(), peer.id().to_string(), limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, author_id, body, sent_at)| {
            Ok(ChatMessage {
                id: parse_uuid(&id, "messages.id")?,
                peer: *peer,
                author_id: parse_uuid(&author_id, "messages.author_id")?,
                body,
                sent_at: from_micros(sent_at, "messages.sent_at")?,
            })
        })
        .collect()
}

/// Raw `scheduled_messages` columns, converted outside the rusqlite closure
/// so that bad values surface as [`DbError::Corrupt`].
struct ScheduledRow {
    id: String,
    author_id: String,
    peer_kind: String,
    peer_id: String,
    body: String,
    scheduled_at: i64,
    status: String,
    sent_at: Option<i64>,
}

impl ScheduledRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            author_id: row.get(1)?,
            peer_kind: row.get(2)?,
            peer_id: row.get(3)?,
            body: row.get(4)?,
            scheduled_at: row.get(5)?,
            status: row.get(6)?,
            sent_at: row.get(7)?,
        })
    }

    fn into_domain(self) -> Result<ScheduledMessage> {
        let peer_id = parse_uuid(&self.peer_id, "scheduled_messages.peer_id")?;
        let peer = Peer::from_parts(&self.peer_kind, peer_id)
            .ok_or_else(|| DbError::Corrupt(format!("peer kind '{}'", self.peer_kind)))?;
        let status = ScheduledStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("scheduled status '{}'", self.status)))?;

        Ok(ScheduledMessage {
            id: parse_uuid(&self.id, "scheduled_messages.id")?,
            author_id: parse_uuid(&self.author_id, "scheduled_messages.author_id")?,
            peer,
            body: self.body,
            scheduled_at: from_micros(self.scheduled_at, "scheduled_messages.scheduled_at")?,
            status,
            sent_at: self
                .sent_at
                .map(|us| from_micros(us, "scheduled_messages.sent_at"))
                .transpose()?,
        })
    }
}

pub(crate) fn to_micros(at: &DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(us: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| DbError::Corrupt(format!("{} out of range: {}", column, us)))
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid> {
    s.parse()
        .map_err(|e| DbError::Corrupt(format!("{} '{}': {}", column, s, e)))
}

/// Stored modes written by newer builds, in or out of the byte range, read
/// as `All` just like unknown wire values.
fn stored_mode(raw: i64) -> NotificationMode {
    u8::try_from(raw)
        .map(NotificationMode::from_wire)
        .unwrap_or(NotificationMode::All)
}
