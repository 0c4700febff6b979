#![forbid(unsafe_code)]

// Identity verification for signaling connections
pub mod jwt;
pub mod types;

pub use jwt::JwtVerifier;
pub use types::AuthError;

use crate::room::UserInfo;

/// Turns a bearer token into the identity a connection acts as
pub trait IdentityVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<UserInfo, AuthError>;
}
