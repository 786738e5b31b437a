use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routing key for a conversation.
///
/// `User(id)` addresses the direct inbox of that user; `Thread(id)` addresses
/// every member of a group thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Peer {
    User(Uuid),
    Thread(Uuid),
}

impl Peer {
    pub fn id(&self) -> Uuid {
        match self {
            Self::User(id) | Self::Thread(id) => *id,
        }
    }

    /// Storage name of the peer kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Thread(_) => "thread",
        }
    }

    /// Rebuild a peer from its stored kind name and id.
    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "user" => Some(Self::User(id)),
            "thread" => Some(Self::Thread(id)),
            _ => None,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A delivered chat message as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub peer: Peer,
    pub author_id: Uuid,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Per-conversation notification mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationMode {
    #[default]
    All,
    None,
    Mentions,
}

impl NotificationMode {
    pub const WIRE_ALL: u8 = 0;
    pub const WIRE_NONE: u8 = 1;
    pub const WIRE_MENTIONS: u8 = 2;

    pub fn to_wire(self) -> u8 {
        match self {
            Self::All => Self::WIRE_ALL,
            Self::None => Self::WIRE_NONE,
            Self::Mentions => Self::WIRE_MENTIONS,
        }
    }

    /// Map a wire value to a mode. Values this build does not know about
    /// (sent by newer clients) fall back to `All`.
    pub fn from_wire(value: u8) -> Self {
        match value {
            Self::WIRE_ALL => Self::All,
            Self::WIRE_NONE => Self::None,
            Self::WIRE_MENTIONS => Self::Mentions,
            _ => Self::All,
        }
    }
}

/// Notification settings a user holds for one conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub mode: NotificationMode,
    pub silent: bool,
    pub important_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Status only ever moves out of `Pending`, and never back.
    pub fn can_transition_to(&self, next: ScheduledStatus) -> bool {
        matches!(self, Self::Pending) && next.is_terminal()
    }
}

impl fmt::Display for ScheduledStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message whose send was deferred by its author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub author_id: Uuid,
    pub peer: Peer,
    pub body: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: ScheduledStatus,
    /// Set only when the item reaches `Sent`.
    pub sent_at: Option<DateTime<Utc>>,
}

/// Trim a timestamp to the microsecond precision used by storage, so that a
/// value handed to subscribers equals the one read back later.
pub fn trim_to_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_wire_mode_falls_back_to_all() {
        assert_eq!(NotificationMode::from_wire(1), NotificationMode::None);
        assert_eq!(NotificationMode::from_wire(2), NotificationMode::Mentions);
        assert_eq!(NotificationMode::from_wire(3), NotificationMode::All);
        assert_eq!(NotificationMode::from_wire(0xff), NotificationMode::All);
    }

    #[test]
    fn status_transitions_only_leave_pending() {
        use ScheduledStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Pending));
        for terminal in [Sent, Failed, Cancelled] {
            for next in [Pending, Sent, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn peer_parts_roundtrip() {
        let id = Uuid::new_v4();
        for peer in [Peer::User(id), Peer::Thread(id)] {
            assert_eq!(Peer::from_parts(peer.kind(), peer.id()), Some(peer));
        }
        assert_eq!(Peer::from_parts("channel", id), None);
    }

    #[test]
    fn trimmed_time_has_no_sub_micro_digits() {
        let at = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(trim_to_micros(at).timestamp_subsec_nanos(), 123_456_000);
    }
}
