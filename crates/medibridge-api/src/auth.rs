use std::sync::Arc;

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use medibridge_db::Database;
use medibridge_gateway::dispatcher::Dispatcher;
use medibridge_types::api::Claims;
use medibridge_types::models::Role;

use crate::error::ApiError;
use crate::relay::Relay;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub relay: Relay,
    pub jwt_secret: String,
}

/// Mint a token the way the auth service does. Used by tests;
/// this server never issues tokens to end users.
pub fn create_token(secret: &str, user_id: Uuid, role: Role) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        role,
        exp: (chrono::Utc::now() + chrono::Duration::days(1)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let user = Uuid::new_v4();
        let token = create_token("secret", user, Role::Doctor).unwrap();
        let claims = decode_token("secret", &token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.role, Role::Doctor);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = create_token("secret", Uuid::new_v4(), Role::Patient).unwrap();
        assert!(matches!(decode_token("other", &token), Err(ApiError::Unauthorized)));
    }
}
