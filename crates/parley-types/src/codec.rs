//! Parley wire protocol: binary frames <-> [`Envelope`].
//!
//! Frame layout (all multi-byte integers are big-endian):
//!
//! ```text
//! [0]    Protocol version (u8, currently 1)
//! [1]    Envelope tag (u8)
//! [2..]  Tag-specific payload; nothing may follow it
//! ```
//!
//! Field encodings:
//!
//! ```text
//! uuid       16 raw bytes
//! string     u32 length + UTF-8 bytes (at most MAX_STRING_LEN)
//! timestamp  i64 seconds since epoch + u32 nanoseconds
//! peer       kind u8 (0 = user, 1 = thread) + uuid
//! bool       u8, exactly 0 or 1
//! option     u8 flag, exactly 0 or 1, then the value when 1
//! settings   mode u8 + silent bool + important_only bool
//! status     u8 (0 pending, 1 sent, 2 failed, 3 cancelled)
//! error      code u16 + message string
//! ```
//!
//! Decoding is closed-world: an unknown version, tag, peer kind, status or
//! error code is rejected. The one deliberate exception is the notification
//! mode byte, which falls back to `All` (see [`NotificationMode::from_wire`]).
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::envelope::{Envelope, ErrorCode};
use crate::models::{
    ChatMessage, NotificationMode, Peer, ScheduledMessage, ScheduledStatus, UserSettings,
};

pub const PROTOCOL_VERSION: u8 = 1;

/// Longest string field accepted on the wire.
pub const MAX_STRING_LEN: usize = 64 * 1024;

pub const TAG_IDENTIFY: u8 = 0x01;
pub const TAG_READY: u8 = 0x02;
pub const TAG_SUBSCRIBE: u8 = 0x03;
pub const TAG_UNSUBSCRIBE: u8 = 0x04;
pub const TAG_SEND_MESSAGE: u8 = 0x10;
pub const TAG_CHAT_MESSAGE: u8 = 0x11;
pub const TAG_SETTINGS_UPDATE: u8 = 0x12;
pub const TAG_ACK: u8 = 0x13;
pub const TAG_SCHEDULE_MESSAGE: u8 = 0x20;
pub const TAG_CANCEL_SCHEDULED: u8 = 0x21;
pub const TAG_SCHEDULED_UPDATE: u8 = 0x22;
pub const TAG_ERROR: u8 = 0x7f;

const PEER_USER: u8 = 0;
const PEER_THREAD: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown envelope tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("{field} is {len} bytes, limit is {MAX_STRING_LEN}")]
    TooLong { field: &'static str, len: usize },
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u64 },
    #[error("timestamp out of range in {0}")]
    InvalidTimestamp(&'static str),
    #[error("{0} unexpected bytes after payload")]
    TrailingBytes(usize),
}

/// Encode an envelope into a complete binary frame.
///
/// Fails only when a string field is longer than [`MAX_STRING_LEN`], so
/// anything `encode` accepts, `decode` accepts back.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(PROTOCOL_VERSION);

    match envelope {
        Envelope::Identify { token, device_id } => {
            buf.put_u8(TAG_IDENTIFY);
            put_string(&mut buf, "token", token)?;
            put_string(&mut buf, "device_id", device_id)?;
        }
        Envelope::Ready { session_id, user_id } => {
            buf.put_u8(TAG_READY);
            put_uuid(&mut buf, session_id);
            put_uuid(&mut buf, user_id);
        }
        Envelope::Subscribe { peer } => {
            buf.put_u8(TAG_SUBSCRIBE);
            put_peer(&mut buf, peer);
        }
        Envelope::Unsubscribe { peer } => {
            buf.put_u8(TAG_UNSUBSCRIBE);
            put_peer(&mut buf, peer);
        }
        Envelope::SendMessage { peer, body } => {
            buf.put_u8(TAG_SEND_MESSAGE);
            put_peer(&mut buf, peer);
            put_string(&mut buf, "body", body)?;
        }
        Envelope::ChatMessage(msg) => {
            buf.put_u8(TAG_CHAT_MESSAGE);
            put_uuid(&mut buf, &msg.id);
            put_peer(&mut buf, &msg.peer);
            put_uuid(&mut buf, &msg.author_id);
            put_string(&mut buf, "body", &msg.body)?;
            put_time(&mut buf, &msg.sent_at);
        }
        Envelope::SettingsUpdate { peer, settings } => {
            buf.put_u8(TAG_SETTINGS_UPDATE);
            put_peer(&mut buf, peer);
            buf.put_u8(settings.mode.to_wire());
            buf.put_u8(settings.silent as u8);
            buf.put_u8(settings.important_only as u8);
        }
        Envelope::Ack {
            peer,
            message_id,
            user_id,
        } => {
            buf.put_u8(TAG_ACK);
            put_peer(&mut buf, peer);
            put_uuid(&mut buf, message_id);
            put_uuid(&mut buf, user_id);
        }
        Envelope::ScheduleMessage {
            peer,
            body,
            scheduled_at,
        } => {
            buf.put_u8(TAG_SCHEDULE_MESSAGE);
            put_peer(&mut buf, peer);
            put_string(&mut buf, "body", body)?;
            put_time(&mut buf, scheduled_at);
        }
        Envelope::CancelScheduled { id } => {
            buf.put_u8(TAG_CANCEL_SCHEDULED);
            put_uuid(&mut buf, id);
        }
        Envelope::ScheduledUpdate(item) => {
            buf.put_u8(TAG_SCHEDULED_UPDATE);
            put_uuid(&mut buf, &item.id);
            put_uuid(&mut buf, &item.author_id);
            put_peer(&mut buf, &item.peer);
            put_string(&mut buf, "body", &item.body)?;
            put_time(&mut buf, &item.scheduled_at);
            buf.put_u8(status_to_wire(item.status));
            match &item.sent_at {
                Some(at) => {
                    buf.put_u8(1);
                    put_time(&mut buf, at);
                }
                None => buf.put_u8(0),
            }
        }
        Envelope::Error { code, message } => {
            buf.put_u8(TAG_ERROR);
            buf.put_u16(code.as_u16());
            put_string(&mut buf, "error message", message)?;
        }
    }

    Ok(buf.freeze())
}

/// Decode a complete binary frame. Every input yields either a whole
/// envelope or an error; nothing is partially accepted.
pub fn decode(frame: &[u8]) -> Result<Envelope, ProtocolError> {
    let mut r = Reader { buf: frame };

    if r.buf.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let version = r.u8("version")?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let tag = r.u8("tag")?;
    let envelope = match tag {
        TAG_IDENTIFY => Envelope::Identify {
            token: r.string("token")?,
            device_id: r.string("device_id")?,
        },
        TAG_READY => Envelope::Ready {
            session_id: r.uuid("session_id")?,
            user_id: r.uuid("user_id")?,
        },
        TAG_SUBSCRIBE => Envelope::Subscribe { peer: r.peer()? },
        TAG_UNSUBSCRIBE => Envelope::Unsubscribe { peer: r.peer()? },
        TAG_SEND_MESSAGE => Envelope::SendMessage {
            peer: r.peer()?,
            body: r.string("body")?,
        },
        TAG_CHAT_MESSAGE => Envelope::ChatMessage(ChatMessage {
            id: r.uuid("message id")?,
            peer: r.peer()?,
            author_id: r.uuid("author_id")?,
            body: r.string("body")?,
            sent_at: r.time("sent_at")?,
        }),
        TAG_SETTINGS_UPDATE => Envelope::SettingsUpdate {
            peer: r.peer()?,
            settings: UserSettings {
                mode: NotificationMode::from_wire(r.u8("mode")?),
                silent: r.bool("silent")?,
                important_only: r.bool("important_only")?,
            },
        },
        TAG_ACK => Envelope::Ack {
            peer: r.peer()?,
            message_id: r.uuid("message_id")?,
            user_id: r.uuid("user_id")?,
        },
        TAG_SCHEDULE_MESSAGE => Envelope::ScheduleMessage {
            peer: r.peer()?,
            body: r.string("body")?,
            scheduled_at: r.time("scheduled_at")?,
        },
        TAG_CANCEL_SCHEDULED => Envelope::CancelScheduled {
            id: r.uuid("scheduled id")?,
        },
        TAG_SCHEDULED_UPDATE => Envelope::ScheduledUpdate(ScheduledMessage {
            id: r.uuid("scheduled id")?,
            author_id: r.uuid("author_id")?,
            peer: r.peer()?,
            body: r.string("body")?,
            scheduled_at: r.time("scheduled_at")?,
            status: r.status()?,
            sent_at: if r.bool("sent_at flag")? {
                Some(r.time("sent_at")?)
            } else {
                None
            },
        }),
        TAG_ERROR => {
            let raw = r.u16("error code")?;
            let code = ErrorCode::from_u16(raw).ok_or(ProtocolError::InvalidValue {
                field: "error code",
                value: raw as u64,
            })?;
            Envelope::Error {
                code,
                message: r.string("error message")?,
            }
        }
        other => return Err(ProtocolError::UnknownTag(other)),
    };

    if !r.buf.is_empty() {
        return Err(ProtocolError::TrailingBytes(r.buf.len()));
    }
    Ok(envelope)
}

fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

fn put_string(buf: &mut BytesMut, field: &'static str, s: &str) -> Result<(), ProtocolError> {
    if s.len() > MAX_STRING_LEN {
        return Err(ProtocolError::TooLong { field, len: s.len() });
    }
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_time(buf: &mut BytesMut, at: &DateTime<Utc>) {
    buf.put_i64(at.timestamp());
    buf.put_u32(at.timestamp_subsec_nanos());
}

fn put_peer(buf: &mut BytesMut, peer: &Peer) {
    let kind = match peer {
        Peer::User(_) => PEER_USER,
        Peer::Thread(_) => PEER_THREAD,
    };
    buf.put_u8(kind);
    put_uuid(buf, &peer.id());
}

fn status_to_wire(status: ScheduledStatus) -> u8 {
    match status {
        ScheduledStatus::Pending => 0,
        ScheduledStatus::Sent => 1,
        ScheduledStatus::Failed => 2,
        ScheduledStatus::Cancelled => 3,
    }
}

/// Bounds-checked cursor over an inbound frame.
struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn need(&self, n: usize, field: &'static str) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Truncated(field));
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        self.need(2, field)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, ProtocolError> {
        self.need(8, field)?;
        Ok(self.buf.get_i64())
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, ProtocolError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidValue {
                field,
                value: other as u64,
            }),
        }
    }

    fn uuid(&mut self, field: &'static str) -> Result<Uuid, ProtocolError> {
        self.need(16, field)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.u32(field)? as usize;
        if len > MAX_STRING_LEN {
            return Err(ProtocolError::TooLong { field, len });
        }
        self.need(len, field)?;
        let s = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| ProtocolError::InvalidUtf8(field))?
            .to_owned();
        self.buf.advance(len);
        Ok(s)
    }

    fn time(&mut self, field: &'static str) -> Result<DateTime<Utc>, ProtocolError> {
        let secs = self.i64(field)?;
        let nanos = self.u32(field)?;
        DateTime::from_timestamp(secs, nanos).ok_or(ProtocolError::InvalidTimestamp(field))
    }

    fn peer(&mut self) -> Result<Peer, ProtocolError> {
        let kind = self.u8("peer kind")?;
        let id = self.uuid("peer id")?;
        match kind {
            PEER_USER => Ok(Peer::User(id)),
            PEER_THREAD => Ok(Peer::Thread(id)),
            other => Err(ProtocolError::InvalidValue {
                field: "peer kind",
                value: other as u64,
            }),
        }
    }

    fn status(&mut self) -> Result<ScheduledStatus, ProtocolError> {
        match self.u8("status")? {
            0 => Ok(ScheduledStatus::Pending),
            1 => Ok(ScheduledStatus::Sent),
            2 => Ok(ScheduledStatus::Failed),
            3 => Ok(ScheduledStatus::Cancelled),
            other => Err(ProtocolError::InvalidValue {
                field: "status",
                value: other as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64, nanos: u32) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, nanos).unwrap()
    }

    fn samples() -> Vec<Envelope> {
        let peer = Peer::Thread(Uuid::new_v4());
        vec![
            Envelope::Identify {
                token: "eyJhbGciOi.x.y".into(),
                device_id: "ipad-7".into(),
            },
            Envelope::Ready {
                session_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            },
            Envelope::Subscribe {
                peer: Peer::User(Uuid::new_v4()),
            },
            Envelope::Unsubscribe { peer },
            Envelope::SendMessage {
                peer,
                body: "héllo 👋".into(),
            },
            Envelope::ChatMessage(ChatMessage {
                id: Uuid::new_v4(),
                peer,
                author_id: Uuid::new_v4(),
                body: String::new(),
                sent_at: at(1_700_000_000, 999_999_999),
            }),
            Envelope::SettingsUpdate {
                peer,
                settings: UserSettings {
                    mode: NotificationMode::Mentions,
                    silent: true,
                    important_only: false,
                },
            },
            Envelope::Ack {
                peer,
                message_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            },
            Envelope::ScheduleMessage {
                peer,
                body: "later".into(),
                scheduled_at: at(-5, 1),
            },
            Envelope::CancelScheduled { id: Uuid::new_v4() },
            Envelope::ScheduledUpdate(ScheduledMessage {
                id: Uuid::new_v4(),
                author_id: Uuid::new_v4(),
                peer,
                body: "hi".into(),
                scheduled_at: at(1_700_000_001, 0),
                status: ScheduledStatus::Sent,
                sent_at: Some(at(1_700_000_002, 500)),
            }),
            Envelope::ScheduledUpdate(ScheduledMessage {
                id: Uuid::new_v4(),
                author_id: Uuid::new_v4(),
                peer,
                body: "hi".into(),
                scheduled_at: at(1_700_000_001, 0),
                status: ScheduledStatus::Cancelled,
                sent_at: None,
            }),
            Envelope::error(ErrorCode::Conflict, "already sending"),
        ]
    }

    #[test]
    fn every_envelope_kind_roundtrips() {
        for env in samples() {
            let frame = encode(&env).unwrap();
            assert_eq!(decode(&frame).unwrap(), env, "kind {}", env.kind());
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let frame = [PROTOCOL_VERSION, 0x55, 0, 0, 0, 0];
        assert_eq!(decode(&frame), Err(ProtocolError::UnknownTag(0x55)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut frame = encode(&Envelope::CancelScheduled { id: Uuid::nil() }).unwrap().to_vec();
        frame[0] = 2;
        assert_eq!(decode(&frame), Err(ProtocolError::UnsupportedVersion(2)));
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert_eq!(decode(&[]), Err(ProtocolError::Empty));
    }

    #[test]
    fn every_truncation_is_rejected() {
        for env in samples() {
            let frame = encode(&env).unwrap();
            for cut in 0..frame.len() {
                assert!(
                    decode(&frame[..cut]).is_err(),
                    "{} accepted at {} of {} bytes",
                    env.kind(),
                    cut,
                    frame.len()
                );
            }
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut frame = encode(&Envelope::Subscribe {
            peer: Peer::User(Uuid::nil()),
        })
        .unwrap()
        .to_vec();
        frame.push(0);
        assert_eq!(decode(&frame), Err(ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn unknown_peer_kind_is_rejected() {
        let mut frame = encode(&Envelope::Subscribe {
            peer: Peer::User(Uuid::nil()),
        })
        .unwrap()
        .to_vec();
        frame[2] = 9;
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::InvalidValue { field: "peer kind", value: 9 })
        ));
    }

    #[test]
    fn non_binary_bool_is_rejected() {
        let mut frame = encode(&Envelope::SettingsUpdate {
            peer: Peer::User(Uuid::nil()),
            settings: UserSettings::default(),
        })
        .unwrap()
        .to_vec();
        let silent = frame.len() - 2;
        frame[silent] = 2;
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::InvalidValue { field: "silent", .. })
        ));
    }

    #[test]
    fn unrecognized_settings_mode_falls_back_to_all() {
        let mut frame = encode(&Envelope::SettingsUpdate {
            peer: Peer::User(Uuid::nil()),
            settings: UserSettings {
                mode: NotificationMode::Mentions,
                silent: true,
                important_only: true,
            },
        })
        .unwrap()
        .to_vec();
        // A newer client's MENTIONS_SILENT_UNKNOWN value.
        let mode = frame.len() - 3;
        frame[mode] = 7;

        match decode(&frame).unwrap() {
            Envelope::SettingsUpdate { settings, .. } => {
                assert_eq!(settings.mode, NotificationMode::All);
                assert!(settings.silent);
                assert!(settings.important_only);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_error_code_is_rejected() {
        let mut frame = encode(&Envelope::error(ErrorCode::Internal, "x")).unwrap().to_vec();
        frame[2..4].copy_from_slice(&418u16.to_be_bytes());
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::InvalidValue { field: "error code", value: 418 })
        ));
    }

    #[test]
    fn oversized_string_is_rejected_before_reading() {
        let mut frame = vec![PROTOCOL_VERSION, TAG_SEND_MESSAGE, PEER_USER];
        frame.extend_from_slice(Uuid::nil().as_bytes());
        frame.extend_from_slice(&((MAX_STRING_LEN as u32) + 1).to_be_bytes());
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::TooLong { field: "body", .. })
        ));
    }

    #[test]
    fn encode_refuses_what_decode_would_reject() {
        let at_limit = Envelope::error(ErrorCode::Internal, "x".repeat(MAX_STRING_LEN));
        let frame = encode(&at_limit).unwrap();
        assert_eq!(decode(&frame).unwrap(), at_limit);

        let over = Envelope::error(ErrorCode::Internal, "x".repeat(MAX_STRING_LEN + 1));
        assert_eq!(
            encode(&over),
            Err(ProtocolError::TooLong {
                field: "error message",
                len: MAX_STRING_LEN + 1
            })
        );
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut frame = vec![PROTOCOL_VERSION, TAG_SEND_MESSAGE, PEER_USER];
        frame.extend_from_slice(Uuid::nil().as_bytes());
        frame.extend_from_slice(&2u32.to_be_bytes());
        frame.extend_from_slice(&[0xc3, 0x28]);
        assert_eq!(decode(&frame), Err(ProtocolError::InvalidUtf8("body")));
    }
}
