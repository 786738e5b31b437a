use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// Claims carried by the credential presented in `Identify`. Tokens are
/// issued elsewhere; the gateway only validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}
