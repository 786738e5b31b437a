use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use parley_db::Database;
use parley_types::api::Claims;
use parley_types::codec;
use parley_types::envelope::Envelope;
use parley_types::models::Peer;

use crate::auth::{Authenticator, Identity, JwtAuthenticator};
use crate::connection::ConnectionConfig;
use crate::error::AuthError;
use crate::queue::Outbound;
use crate::registry::{Registry, RegistryConfig, Session};
use crate::state::{self, GatewayConfig, GatewayState};

pub const SECRET: &str = "test-secret";

/// Accepts a fixed set of tokens.
#[derive(Default)]
pub struct StaticAuth {
    tokens: HashMap<String, Identity>,
    first: Option<Uuid>,
}

impl StaticAuth {
    /// One token for a fresh user called alice.
    pub fn one(token: &str) -> Self {
        Self::default().with(token, Uuid::new_v4(), "alice")
    }

    pub fn with(mut self, token: &str, user_id: Uuid, username: &str) -> Self {
        self.first.get_or_insert(user_id);
        self.tokens.insert(
            token.to_string(),
            Identity {
                user_id,
                username: username.to_string(),
            },
        );
        self
    }
}

impl Authenticator for StaticAuth {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown test token".into()))
    }
}

/// A registry over `auth`, plus the user id of its first token.
pub fn registry_with(auth: StaticAuth, queue_capacity: usize) -> (Registry, Uuid) {
    let user_id = auth.first.unwrap_or_default();
    let registry = Registry::new(Arc::new(auth), RegistryConfig { queue_capacity });
    (registry, user_id)
}

/// Register a session and consume its `Ready` frame.
pub fn connect(registry: &Registry, token: &str, device_id: &str) -> Arc<Session> {
    let session = registry.register(token, device_id).unwrap();
    match session.outbound().pop().now_or_never() {
        Some(Outbound::Frame(frame)) => {
            assert!(matches!(codec::decode(&frame), Ok(Envelope::Ready { .. })));
        }
        other => panic!("expected a queued ready frame, got {:?}", other),
    }
    session
}

pub fn token(user_id: Uuid, username: &str) -> String {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

/// Full gateway state over an in-memory database with two known users.
pub struct Harness {
    pub state: GatewayState,
    pub alice: Uuid,
    pub bob: Uuid,
    pub alice_token: String,
    pub bob_token: String,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_connection(ConnectionConfig::default())
    }

    pub fn with_connection(connection: ConnectionConfig) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        db.upsert_user(alice, "alice").unwrap();
        db.upsert_user(bob, "bob").unwrap();

        let config = GatewayConfig {
            connection,
            ..GatewayConfig::default()
        };
        let state = state::build(db, Arc::new(JwtAuthenticator::new(SECRET)), config);

        Self {
            state,
            alice,
            bob,
            alice_token: token(alice, "alice"),
            bob_token: token(bob, "bob"),
        }
    }

    pub fn connect_alice(&self) -> Arc<Session> {
        connect(&self.state.registry, &self.alice_token, "phone")
    }

    pub fn connect_bob(&self) -> Arc<Session> {
        connect(&self.state.registry, &self.bob_token, "phone")
    }

    pub fn thread_with_alice_and_bob(&self) -> Peer {
        let id = Uuid::new_v4();
        self.state
            .db
            .create_thread(id, "alice & bob", &[self.alice, self.bob])
            .unwrap();
        Peer::Thread(id)
    }
}

/// Everything currently queued for `session`, decoded.
pub fn drain(session: &Session) -> Vec<Envelope> {
    let mut out = Vec::new();
    while !session.outbound().is_empty() {
        match session.outbound().pop().now_or_never() {
            Some(Outbound::Frame(frame)) => out.push(codec::decode(&frame).unwrap()),
            _ => break,
        }
    }
    out
}
