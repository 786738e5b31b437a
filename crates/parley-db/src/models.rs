use parley_types::models::{ChatMessage, ScheduledMessage, ScheduledStatus};
use thiserror::Error;
use uuid::Uuid;

/// Why a message could not be sent. Terminal for scheduled messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendRejection {
    #[error("message body is empty")]
    EmptyBody,
    #[error("author is not a known user")]
    UnknownAuthor,
    #[error("recipient is not a known user")]
    UnknownRecipient,
    #[error("thread does not exist")]
    UnknownThread,
    #[error("author is not a member of the thread")]
    NotAMember,
}

impl SendRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyBody => "empty_body",
            Self::UnknownAuthor => "unknown_author",
            Self::UnknownRecipient => "unknown_recipient",
            Self::UnknownThread => "unknown_thread",
            Self::NotAMember => "not_a_member",
        }
    }
}

/// Result of trying to send one due scheduled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Message row inserted and item marked `sent` in one transaction.
    Sent {
        item: ScheduledMessage,
        message: ChatMessage,
    },
    /// The send was refused; item marked `failed`.
    Failed {
        item: ScheduledMessage,
        reason: SendRejection,
    },
    /// Item was no longer pending (cancelled, or resolved by an earlier run).
    Skipped { id: Uuid, status: Option<ScheduledStatus> },
}

/// Result of a cancellation request against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(ScheduledMessage),
    AlreadyCancelled(ScheduledMessage),
    /// Item already reached `sent` or `failed`.
    Resolved(ScheduledMessage),
    NotFound,
}
