use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

use parley_types::api::Claims;

use crate::error::AuthError;

/// Who a credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// Validates the opaque credential presented during the handshake.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// HS256 JWTs signed with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        Ok(Identity {
            user_id: data.claims.sub,
            username: data.claims.username,
        })
    }
}
