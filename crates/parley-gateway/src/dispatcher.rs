use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};
use uuid::Uuid;

use parley_types::codec::{self, ProtocolError};
use parley_types::envelope::Envelope;
use parley_types::models::{ChatMessage, Peer};

use crate::queue::Enqueued;
use crate::registry::{Registry, SessionId};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Position of this publish in the dispatcher's arrival order.
    pub sequence: u64,
    pub recipients: usize,
    pub queued: usize,
    /// Queued after the recipient's queue evicted an older frame.
    pub dropped_oldest: usize,
    /// Recipient disconnected between snapshot and send.
    pub missed: usize,
}

/// Routes envelopes to the sessions interested in them.
///
/// Sessions are looked up by id at send time, so a disconnect racing a
/// fan-out simply turns that recipient into a miss.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    /// Serializes fan-outs so racing publishers reach every subscriber in
    /// the same (arrival) order. Holds the last sequence number issued.
    sequencer: Arc<Mutex<u64>>,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            sequencer: Arc::new(Mutex::new(0)),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Deliver `envelope` to every session subscribed to `peer` at call time.
    pub fn publish(&self, peer: &Peer, envelope: &Envelope) -> Result<PublishReport, ProtocolError> {
        self.fan_out(envelope, |registry| registry.subscribers(peer))
    }

    /// Deliver `envelope` to every session of one user (settings changes,
    /// scheduled item updates, command replies across devices).
    pub fn publish_to_user(
        &self,
        user_id: Uuid,
        envelope: &Envelope,
    ) -> Result<PublishReport, ProtocolError> {
        self.fan_out(envelope, |registry| registry.user_sessions(user_id))
    }

    /// The send path shared by live and scheduled messages: the peer's
    /// subscribers plus the author's own sessions, each once.
    pub fn publish_message(&self, message: &ChatMessage) -> Result<PublishReport, ProtocolError> {
        let envelope = Envelope::ChatMessage(message.clone());
        self.fan_out(&envelope, |registry| {
            let mut seen = HashSet::new();
            registry
                .subscribers(&message.peer)
                .into_iter()
                .chain(registry.user_sessions(message.author_id))
                .filter(|id| seen.insert(*id))
                .collect()
        })
    }

    /// Nothing is queued anywhere when the envelope cannot be encoded.
    fn fan_out<F>(&self, envelope: &Envelope, resolve: F) -> Result<PublishReport, ProtocolError>
    where
        F: FnOnce(&Registry) -> Vec<SessionId>,
    {
        // Encoded once, shared by every recipient.
        let frame = codec::encode(envelope)?;

        let mut last = self.sequencer.lock().unwrap_or_else(PoisonError::into_inner);
        *last += 1;

        let recipients = resolve(&self.registry);
        let mut report = PublishReport {
            sequence: *last,
            recipients: recipients.len(),
            ..PublishReport::default()
        };

        for id in recipients {
            match self.registry.send_frame(id, frame.clone()) {
                Ok(Enqueued::Queued) => report.queued += 1,
                Ok(Enqueued::DroppedOldest) => {
                    report.queued += 1;
                    report.dropped_oldest += 1;
                }
                Err(e) => {
                    trace!("{} not queued for session {}: {}", envelope.kind(), id, e);
                    report.missed += 1;
                }
            }
        }
        drop(last);

        debug!(
            "published {} #{} to {} sessions ({} missed, {} evictions)",
            envelope.kind(),
            report.sequence,
            report.recipients,
            report.missed,
            report.dropped_oldest
        );
        Ok(report)
    }
}
