#![forbid(unsafe_code)]

use crate::auth::types::{AuthError, Claims};
use crate::auth::IdentityVerifier;
use crate::room::UserInfo;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use std::time::{SystemTime, UNIX_EPOCH};

const TOKEN_LIFETIME_SECS: u64 = 15 * 60;

/// Issues a short-lived HS256 token. The platform's auth service owns token
/// issuance; this exists for tooling and tests that need a valid identity.
pub fn create_token(user: &UserInfo, secret: &str) -> Result<String, AuthError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| AuthError::Encoding("System clock error".to_string()))?;

    let claims = Claims {
        sub: user.id.clone(),
        name: user.username.clone(),
        avatar: user.avatar.clone(),
        exp: (now.as_secs() + TOKEN_LIFETIME_SECS) as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Encoding(format!("JWT encode error: {e}")))
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })?;

    Ok(data.claims)
}

/// Verifies HS256 tokens against a shared secret
pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserInfo, AuthError> {
        validate_token(token, &self.secret).map(UserInfo::from)
    }
}
