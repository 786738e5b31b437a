use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::codec;
use parley_types::envelope::Envelope;
use parley_types::models::Peer;

use crate::auth::Authenticator;
use crate::error::{AuthError, DeliveryError};
use crate::queue::{CloseReason, Enqueued, OutboundQueue};

/// Unique per live connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live, authenticated connection.
///
/// Only the registry creates sessions. The connection task holds an `Arc` to
/// drain the outbound queue; everything else refers to sessions by id.
pub struct Session {
    id: SessionId,
    user_id: Uuid,
    username: String,
    device_id: String,
    connected_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    outbound: OutboundQueue,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(ms).unwrap_or(self.connected_at)
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Bound of each session's outbound queue.
    pub queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

/// Owns every live session and its subscriptions.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    authenticator: Arc<dyn Authenticator>,
    config: RegistryConfig,
    tables: RwLock<Tables>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Entry>,
    by_peer: HashMap<Peer, HashSet<SessionId>>,
    by_user: HashMap<Uuid, HashSet<SessionId>>,
}

struct Entry {
    session: Arc<Session>,
    peers: HashSet<Peer>,
}

impl Registry {
    pub fn new(authenticator: Arc<dyn Authenticator>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                authenticator,
                config,
                tables: RwLock::new(Tables::default()),
            }),
        }
    }

    /// Validate `token` and create a session bound to its user and `device_id`.
    /// The session's queue starts with its `Ready` frame.
    pub fn register(&self, token: &str, device_id: &str) -> Result<Arc<Session>, AuthError> {
        let identity = self.inner.authenticator.authenticate(token)?;

        let now = Utc::now();
        let session = Arc::new(Session {
            id: SessionId::new(),
            user_id: identity.user_id,
            username: identity.username,
            device_id: device_id.to_string(),
            connected_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            outbound: OutboundQueue::new(self.inner.config.queue_capacity),
        });

        // Queued before the session is visible, so nothing published to
        // this user can overtake it.
        let ready = Envelope::Ready {
            session_id: session.id.as_uuid(),
            user_id: session.user_id,
        };
        match codec::encode(&ready) {
            Ok(frame) => {
                let _ = session.outbound.push(frame);
            }
            Err(e) => warn!("session {} ready frame not queued: {}", session.id, e),
        }

        let mut tables = self.write();
        tables
            .by_user
            .entry(session.user_id)
            .or_default()
            .insert(session.id);
        tables.sessions.insert(
            session.id,
            Entry {
                session: session.clone(),
                peers: HashSet::new(),
            },
        );
        drop(tables);

        info!(
            "session {} registered for {} ({}) on device {}",
            session.id, session.username, session.user_id, session.device_id
        );
        Ok(session)
    }

    /// Add `peer` to the session's interest set. Returns false if the session
    /// is gone.
    pub fn subscribe(&self, id: SessionId, peer: Peer) -> bool {
        let mut tables = self.write();
        let Some(entry) = tables.sessions.get_mut(&id) else {
            return false;
        };
        if entry.peers.insert(peer) {
            tables.by_peer.entry(peer).or_default().insert(id);
            debug!("session {} subscribed to {}", id, peer);
        }
        true
    }

    pub fn unsubscribe(&self, id: SessionId, peer: Peer) -> bool {
        let mut tables = self.write();
        let Some(entry) = tables.sessions.get_mut(&id) else {
            return false;
        };
        if entry.peers.remove(&peer) {
            remove_index(&mut tables.by_peer, &peer, id);
            debug!("session {} unsubscribed from {}", id, peer);
        }
        true
    }

    pub fn is_subscribed(&self, id: SessionId, peer: &Peer) -> bool {
        self.read()
            .sessions
            .get(&id)
            .is_some_and(|entry| entry.peers.contains(peer))
    }

    pub fn subscriptions(&self, id: SessionId) -> Vec<Peer> {
        self.read()
            .sessions
            .get(&id)
            .map(|entry| entry.peers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Encode and queue an envelope for one session. Never blocks.
    pub fn send(&self, id: SessionId, envelope: &Envelope) -> Result<Enqueued, DeliveryError> {
        self.send_frame(id, codec::encode(envelope)?)
    }

    /// Queue an already encoded frame for one session. Never blocks.
    pub fn send_frame(&self, id: SessionId, frame: Bytes) -> Result<Enqueued, DeliveryError> {
        let session = self.session(id).ok_or(DeliveryError::SessionGone)?;
        let outcome = session.outbound.push(frame)?;
        if outcome == Enqueued::DroppedOldest {
            debug!(
                "session {} queue full, dropped oldest frame ({} total)",
                id,
                session.outbound.dropped()
            );
        }
        Ok(outcome)
    }

    /// Remove the session and close its queue with `reason`. Idempotent.
    pub fn close(&self, id: SessionId, reason: CloseReason) -> Option<Arc<Session>> {
        let mut tables = self.write();
        let entry = tables.sessions.remove(&id)?;
        for peer in &entry.peers {
            remove_index(&mut tables.by_peer, peer, id);
        }
        remove_index(&mut tables.by_user, &entry.session.user_id, id);
        drop(tables);

        entry.session.outbound.close(reason);
        info!(
            "session {} for {} closed: {}",
            id,
            entry.session.user_id,
            reason.reason()
        );
        Some(entry.session)
    }

    pub fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        self.close(id, CloseReason::Normal)
    }

    /// Close every session, e.g. on shutdown.
    pub fn close_all(&self, reason: CloseReason) {
        let ids: Vec<SessionId> = self.read().sessions.keys().copied().collect();
        for id in ids {
            self.close(id, reason);
        }
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.read().sessions.get(&id).map(|entry| entry.session.clone())
    }

    /// Snapshot of sessions subscribed to `peer` right now.
    pub fn subscribers(&self, peer: &Peer) -> Vec<SessionId> {
        self.read()
            .by_peer
            .get(peer)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every session belonging to `user_id`.
    pub fn user_sessions(&self, user_id: Uuid) -> Vec<SessionId> {
        self.read()
            .by_user
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Table updates never panic midway, so recovering from poison is safe.
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.inner.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn remove_index<K: Eq + std::hash::Hash>(
    index: &mut HashMap<K, HashSet<SessionId>>,
    key: &K,
    id: SessionId,
) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Outbound;
    use crate::test_support::{StaticAuth, connect, registry_with};

    #[test]
    fn register_binds_identity_and_device() {
        let (registry, alice) = registry_with(StaticAuth::one("tok-a"), 8);
        let session = registry.register("tok-a", "phone").unwrap();

        assert_eq!(session.user_id(), alice);
        assert_eq!(session.device_id(), "phone");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.user_sessions(alice), vec![session.id()]);
    }

    #[tokio::test]
    async fn ready_is_queued_ahead_of_everything_else() {
        let (registry, alice) = registry_with(StaticAuth::one("tok-a"), 8);
        let session = registry.register("tok-a", "phone").unwrap();
        registry
            .send(session.id(), &Envelope::CancelScheduled { id: Uuid::nil() })
            .unwrap();

        match session.outbound().pop().await {
            Outbound::Frame(frame) => assert_eq!(
                codec::decode(&frame).unwrap(),
                Envelope::Ready {
                    session_id: session.id().as_uuid(),
                    user_id: alice,
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.outbound().len(), 1);
    }

    #[tokio::test]
    async fn oversized_envelope_is_refused_before_queueing() {
        let (registry, _) = registry_with(StaticAuth::one("tok-a"), 8);
        let session = connect(&registry, "tok-a", "phone");
        let huge = Envelope::error(
            parley_types::envelope::ErrorCode::Internal,
            "x".repeat(codec::MAX_STRING_LEN + 1),
        );

        assert!(matches!(
            registry.send(session.id(), &huge),
            Err(DeliveryError::Unencodable(_))
        ));
        assert!(session.outbound().is_empty());
    }

    #[test]
    fn bad_credential_creates_no_session() {
        let (registry, _) = registry_with(StaticAuth::one("tok-a"), 8);
        assert!(registry.register("nope", "phone").is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn every_session_gets_a_fresh_id() {
        let (registry, _) = registry_with(StaticAuth::one("tok-a"), 8);
        let a = registry.register("tok-a", "phone").unwrap();
        let b = registry.register("tok-a", "laptop").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn subscribe_and_unsubscribe_are_idempotent() {
        let (registry, alice) = registry_with(StaticAuth::one("tok-a"), 8);
        let session = registry.register("tok-a", "phone").unwrap();
        let peer = Peer::User(alice);

        assert!(registry.subscribe(session.id(), peer));
        assert!(registry.subscribe(session.id(), peer));
        assert_eq!(registry.subscribers(&peer), vec![session.id()]);
        assert_eq!(registry.subscriptions(session.id()), vec![peer]);

        assert!(registry.unsubscribe(session.id(), peer));
        assert!(registry.unsubscribe(session.id(), peer));
        assert!(registry.subscribers(&peer).is_empty());
    }

    #[tokio::test]
    async fn send_queues_encoded_envelope() {
        let (registry, alice) = registry_with(StaticAuth::one("tok-a"), 8);
        let session = connect(&registry, "tok-a", "phone");
        let env = Envelope::Subscribe {
            peer: Peer::User(alice),
        };

        registry.send(session.id(), &env).unwrap();
        match session.outbound().pop().await {
            Outbound::Frame(frame) => assert_eq!(codec::decode(&frame).unwrap(), env),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unregister_removes_indexes_and_closes_queue() {
        let (registry, alice) = registry_with(StaticAuth::one("tok-a"), 8);
        let session = registry.register("tok-a", "phone").unwrap();
        let peer = Peer::User(alice);
        registry.subscribe(session.id(), peer);

        assert!(registry.unregister(session.id()).is_some());
        assert!(registry.unregister(session.id()).is_none());

        assert!(registry.subscribers(&peer).is_empty());
        assert!(registry.user_sessions(alice).is_empty());
        assert!(!registry.subscribe(session.id(), peer));
        assert_eq!(
            registry.send(session.id(), &Envelope::CancelScheduled { id: Uuid::nil() }),
            Err(DeliveryError::SessionGone)
        );
        assert_eq!(
            session.outbound().pop().await,
            Outbound::Closed(CloseReason::Normal)
        );
    }

    #[test]
    fn concurrent_unregister_and_send_do_not_panic() {
        let (registry, alice) = registry_with(StaticAuth::one("tok-a"), 4);
        let peer = Peer::User(alice);
        let sessions: Vec<_> = (0..32)
            .map(|_| {
                let s = registry.register("tok-a", "d").unwrap();
                registry.subscribe(s.id(), peer);
                s.id()
            })
            .collect();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for id in &sessions {
                    registry.unregister(*id);
                }
            });
            scope.spawn(|| {
                let env = Envelope::CancelScheduled { id: Uuid::nil() };
                for _ in 0..64 {
                    for id in registry.subscribers(&peer) {
                        let _ = registry.send(id, &env);
                    }
                }
            });
        });

        assert!(registry.is_empty());
        assert!(registry.subscribers(&peer).is_empty());
    }
}
