use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use parley_types::models::{ChatMessage, ScheduledMessage, ScheduledStatus};

use crate::models::{CancelOutcome, DeliveryOutcome};
use crate::queries::{
    insert_message_row, query_due_scheduled, query_scheduled, to_micros, validate_send,
};
use crate::{Database, DbError, Result};

/// Persistence contract used by the scheduled delivery loop.
///
/// Implementations must make `deliver_scheduled` atomic: the message row and
/// the item's terminal status are committed together or not at all.
pub trait ScheduleStore: Send + Sync + 'static {
    fn insert_scheduled(&self, item: &ScheduledMessage) -> Result<()>;

    /// Pending items with `scheduled_at <= now`, ordered by `scheduled_at`.
    fn due_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledMessage>>;

    fn deliver_scheduled(&self, id: Uuid, message_id: Uuid, now: DateTime<Utc>) -> Result<DeliveryOutcome>;

    fn cancel_scheduled(&self, id: Uuid, author_id: Uuid) -> Result<CancelOutcome>;
}

impl ScheduleStore for Database {
    fn insert_scheduled(&self, item: &ScheduledMessage) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_messages
                    (id, author_id, peer_kind, peer_id, body, scheduled_at, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    item.id.to_string(),
                    item.author_id.to_string(),
                    item.peer.kind(),
                    item.peer.id().to_string(),
                    item.body,
                    to_micros(&item.scheduled_at),
                    item.status.as_str(),
                    to_micros(&Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    fn due_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledMessage>> {
        self.with_conn(|conn| query_due_scheduled(conn, &now, limit))
    }

    fn deliver_scheduled(&self, id: Uuid, message_id: Uuid, now: DateTime<Utc>) -> Result<DeliveryOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let mut item = match query_scheduled(&tx, id)? {
                Some(item) if item.status == ScheduledStatus::Pending => item,
                Some(item) => {
                    return Ok(DeliveryOutcome::Skipped {
                        id,
                        status: Some(item.status),
                    });
                }
                None => return Ok(DeliveryOutcome::Skipped { id, status: None }),
            };

            match validate_send(&tx, item.author_id, &item.peer, &item.body) {
                Ok(()) => {}
                Err(DbError::Rejected(reason)) => {
                    tx.execute(
                        "UPDATE scheduled_messages SET status = 'failed', failure_reason = ?2
                         WHERE id = ?1 AND status = 'pending'",
                        params![id.to_string(), reason.as_str()],
                    )?;
                    tx.commit()?;
                    item.status = ScheduledStatus::Failed;
                    return Ok(DeliveryOutcome::Failed { item, reason });
                }
                Err(e) => return Err(e),
            }

            let message = ChatMessage {
                id: message_id,
                peer: item.peer,
                author_id: item.author_id,
                body: item.body.clone(),
                sent_at: now,
            };
            insert_message_row(&tx, &message, Some(id))?;

            let changed = tx.execute(
                "UPDATE scheduled_messages SET status = 'sent', sent_at = ?2, message_id = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), to_micros(&now), message_id.to_string()],
            )?;
            if changed != 1 {
                // Dropping the transaction rolls back the message insert.
                return Ok(DeliveryOutcome::Skipped { id, status: None });
            }
            tx.commit()?;

            item.status = ScheduledStatus::Sent;
            item.sent_at = Some(now);
            Ok(DeliveryOutcome::Sent { item, message })
        })
    }

    fn cancel_scheduled(&self, id: Uuid, author_id: Uuid) -> Result<CancelOutcome> {
        self.with_conn(|conn| {
            let mut item = match query_scheduled(conn, id)? {
                Some(item) if item.author_id == author_id => item,
                _ => return Ok(CancelOutcome::NotFound),
            };

            match item.status {
                ScheduledStatus::Pending => {
                    let changed = conn.execute(
                        "UPDATE scheduled_messages SET status = 'cancelled'
                         WHERE id = ?1 AND status = 'pending'",
                        [id.to_string()],
                    )?;
                    if changed == 1 {
                        item.status = ScheduledStatus::Cancelled;
                        Ok(CancelOutcome::Cancelled(item))
                    } else {
                        match query_scheduled(conn, id)? {
                            Some(current) => Ok(CancelOutcome::Resolved(current)),
                            None => Ok(CancelOutcome::NotFound),
                        }
                    }
                }
                ScheduledStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled(item)),
                ScheduledStatus::Sent | ScheduledStatus::Failed => Ok(CancelOutcome::Resolved(item)),
            }
        })
    }
}
