//! Bounded per-session outbound queue.
//!
//! Producers (the dispatcher, command replies) never wait. When the queue is
//! full the oldest queued frame is dropped to make room: a slow client loses
//! stale updates instead of stalling fan-out for everyone else. Closing the
//! queue discards whatever is still pending.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::DeliveryError;

/// Why a session's transport is being closed. Maps onto websocket close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client went away or the session was unregistered.
    Normal,
    /// Server is shutting down.
    GoingAway,
    /// A binary frame failed to decode.
    ProtocolViolation,
    /// A text frame arrived.
    UnsupportedData,
    /// Handshake credential refused, or no handshake in time.
    AuthFailed,
    /// No activity or missed heartbeats.
    IdleTimeout,
    /// The server could not set the session up.
    InternalError,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolViolation => 1002,
            Self::UnsupportedData => 1003,
            Self::AuthFailed => 4001,
            Self::IdleTimeout => 4008,
            Self::InternalError => 1011,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Normal => "bye",
            Self::GoingAway => "server shutting down",
            Self::ProtocolViolation => "malformed frame",
            Self::UnsupportedData => "binary frames only",
            Self::AuthFailed => "authentication failed",
            Self::IdleTimeout => "idle timeout",
            Self::InternalError => "internal error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queued after evicting the oldest pending frame.
    DroppedOldest,
}

/// What the writer gets next.
#[derive(Debug, PartialEq, Eq)]
pub enum Outbound {
    Frame(Bytes),
    Closed(CloseReason),
}

pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

struct QueueState {
    frames: VecDeque<Bytes>,
    closed: Option<CloseReason>,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity.min(64)),
                closed: None,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn push(&self, frame: Bytes) -> Result<Enqueued, DeliveryError> {
        let mut state = self.lock();
        if state.closed.is_some() {
            return Err(DeliveryError::QueueClosed);
        }

        let outcome = if state.frames.len() >= self.capacity {
            state.frames.pop_front();
            state.dropped += 1;
            Enqueued::DroppedOldest
        } else {
            Enqueued::Queued
        };
        state.frames.push_back(frame);
        drop(state);

        self.notify.notify_one();
        Ok(outcome)
    }

    /// Close the queue. The first reason wins; pending frames are discarded.
    pub fn close(&self, reason: CloseReason) {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(reason);
            state.frames.clear();
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next frame, or for the close reason. Single consumer.
    pub async fn pop(&self) -> Outbound {
        loop {
            {
                let mut state = self.lock();
                if let Some(reason) = state.closed {
                    return Outbound::Closed(reason);
                }
                if let Some(frame) = state.frames.pop_front() {
                    return Outbound::Frame(frame);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Frames evicted by the drop-oldest policy over the queue's lifetime.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    // Critical sections never panic, so a poisoned lock still holds valid state.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
