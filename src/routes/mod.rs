// Route module decomposition — each domain area in its own file.
// Shared request guards live here; route functions in submodules.

mod messages;
mod rooms;
mod socket;
mod system;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use messages::get_messages;
pub use rooms::{get_room, list_rooms, lock_room, register_user};
pub use socket::chat_socket;
pub use system::{health, not_found, stats, unauthorized};

// --- Shared request guards ---

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

use crate::config::ChatConfig;
use crate::models::Claims;

/// Bearer token, from the `Authorization` header or the `token` query
/// parameter. Both transports are accepted because some clients cannot set
/// headers on a socket upgrade.
pub struct AuthToken(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthToken {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        if let Some(auth) = req.headers().get_one("Authorization")
            && let Some(token) = auth.strip_prefix("Bearer ")
        {
            return Outcome::Success(AuthToken(token.to_string()));
        }
        if let Some(Ok(token)) = req.query_value::<&str>("token")
            && !token.is_empty()
        {
            return Outcome::Success(AuthToken(token.to_string()));
        }
        Outcome::Forward(Status::Unauthorized)
    }
}

/// `Origin` header of the upgrade handshake, if any.
pub struct UpgradeOrigin(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for UpgradeOrigin {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(UpgradeOrigin(
            req.headers().get_one("Origin").map(String::from),
        ))
    }
}

/// HS256 validation of a collaborator-issued token. Signature and expiry
/// only; the claims are opaque identity.
pub fn validate_token(
    cfg: &ChatConfig,
    token: &str,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    if cfg.jwt_secret.is_empty() {
        return Err(jsonwebtoken::errors::ErrorKind::InvalidKeyFormat.into());
    }
    jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
    )
    .map(|data| data.claims)
}
