use parley_db::{DbError, SendRejection};
use parley_types::codec::ProtocolError;
use parley_types::envelope::ErrorCode;
use parley_types::models::ScheduledStatus;
use thiserror::Error;
use uuid::Uuid;

/// Handshake credential was refused. No session is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no credential presented")]
    MissingCredential,
    #[error("credential expired")]
    Expired,
    #[error("invalid credential: {0}")]
    Invalid(String),
}

/// A frame could not be queued for a session. Never fatal to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("session is no longer registered")]
    SessionGone,
    #[error("session queue is closed")]
    QueueClosed,
    #[error("envelope cannot be encoded: {0}")]
    Unencodable(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduled message: {0}")]
    Invalid(&'static str),

    #[error("scheduled message {0} not found")]
    NotFound(Uuid),

    #[error("scheduled message {id} is already {status}")]
    Conflict { id: Uuid, status: ScheduledStatus },

    #[error("scheduled message {0} is being sent")]
    InFlight(Uuid),

    #[error("persistence: {0}")]
    Persistence(#[from] DbError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A client command was refused. Reported back as an `Error` envelope; the
/// connection stays open.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{1}")]
    Refused(ErrorCode, &'static str),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("reply cannot be encoded: {0}")]
    Encode(#[from] ProtocolError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Refused(code, _) => *code,
            Self::Db(DbError::Rejected(rejection)) => rejection_code(*rejection),
            Self::Db(_) | Self::Join(_) | Self::Encode(_) => ErrorCode::Internal,
            Self::Scheduler(e) => match e {
                SchedulerError::Invalid(_) => ErrorCode::BadRequest,
                SchedulerError::NotFound(_) => ErrorCode::NotFound,
                SchedulerError::Conflict { .. } | SchedulerError::InFlight(_) => ErrorCode::Conflict,
                SchedulerError::Persistence(_) | SchedulerError::Join(_) => ErrorCode::Internal,
            },
        }
    }

    /// Text sent to the client. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self.code() {
            ErrorCode::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

fn rejection_code(rejection: SendRejection) -> ErrorCode {
    match rejection {
        SendRejection::EmptyBody => ErrorCode::BadRequest,
        SendRejection::UnknownRecipient | SendRejection::UnknownThread => ErrorCode::NotFound,
        SendRejection::UnknownAuthor | SendRejection::NotAMember => ErrorCode::Forbidden,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_map_to_wire_codes() {
        let conflict = CommandError::from(SchedulerError::Conflict {
            id: Uuid::nil(),
            status: ScheduledStatus::Sent,
        });
        assert_eq!(conflict.code(), ErrorCode::Conflict);
        assert_eq!(
            CommandError::from(SchedulerError::InFlight(Uuid::nil())).code(),
            ErrorCode::Conflict
        );
        assert_eq!(
            CommandError::from(DbError::Rejected(SendRejection::NotAMember)).code(),
            ErrorCode::Forbidden
        );
        assert_eq!(
            CommandError::from(DbError::Rejected(SendRejection::UnknownThread)).code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn internal_details_are_not_sent_to_clients() {
        let err = CommandError::from(DbError::Corrupt("bad uuid in row 7".into()));
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.client_message(), "internal error");

        let unencodable = CommandError::from(ProtocolError::TooLong {
            field: "body",
            len: 70_000,
        });
        assert_eq!(unencodable.code(), ErrorCode::Internal);
        assert_eq!(unencodable.client_message(), "internal error");

        let refused = CommandError::Refused(ErrorCode::Forbidden, "not a member of this thread");
        assert_eq!(refused.client_message(), "not a member of this thread");
    }
}
