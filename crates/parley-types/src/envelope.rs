use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{ChatMessage, Peer, ScheduledMessage, UserSettings};

/// Frames exchanged over the gateway, in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// First frame of every connection: authenticate this device
    Identify { token: String, device_id: String },

    /// Server confirms the handshake
    Ready { session_id: Uuid, user_id: Uuid },

    /// Start receiving events for a conversation
    Subscribe { peer: Peer },

    /// Stop receiving events for a conversation
    Unsubscribe { peer: Peer },

    /// Post a message now
    SendMessage { peer: Peer, body: String },

    /// A message was posted to a conversation
    ChatMessage(ChatMessage),

    /// Notification settings for a conversation changed
    SettingsUpdate { peer: Peer, settings: UserSettings },

    /// Delivery acknowledgement of a message
    Ack {
        peer: Peer,
        message_id: Uuid,
        user_id: Uuid,
    },

    /// Post a message later
    ScheduleMessage {
        peer: Peer,
        body: String,
        scheduled_at: DateTime<Utc>,
    },

    /// Withdraw a pending scheduled message
    CancelScheduled { id: Uuid },

    /// State of one of the author's scheduled messages
    ScheduledUpdate(ScheduledMessage),

    /// A command was refused
    Error { code: ErrorCode, message: String },
}

impl Envelope {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::Ready { .. } => "ready",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::SendMessage { .. } => "send_message",
            Self::ChatMessage(_) => "chat_message",
            Self::SettingsUpdate { .. } => "settings_update",
            Self::Ack { .. } => "ack",
            Self::ScheduleMessage { .. } => "schedule_message",
            Self::CancelScheduled { .. } => "cancel_scheduled",
            Self::ScheduledUpdate(_) => "scheduled_update",
            Self::Error { .. } => "error",
        }
    }

    /// Returns the conversation this envelope is scoped to, if any.
    pub fn peer(&self) -> Option<Peer> {
        match self {
            Self::Subscribe { peer }
            | Self::Unsubscribe { peer }
            | Self::SendMessage { peer, .. }
            | Self::SettingsUpdate { peer, .. }
            | Self::Ack { peer, .. }
            | Self::ScheduleMessage { peer, .. } => Some(*peer),
            Self::ChatMessage(msg) => Some(msg.peer),
            Self::ScheduledUpdate(item) => Some(item.peer),
            _ => None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Reason a command was refused. Values mirror HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    Conflict = 409,
    Internal = 500,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            400 => Some(Self::BadRequest),
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            409 => Some(Self::Conflict),
            500 => Some(Self::Internal),
            _ => None,
        }
    }
}
