#![forbid(unsafe_code)]

use crate::room::UserInfo;
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    InvalidToken,
    MissingToken,
    TokenExpired,
    Encoding(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidToken => write!(f, "invalid token"),
            AuthError::MissingToken => write!(f, "missing token"),
            AuthError::TokenExpired => write!(f, "token expired"),
            AuthError::Encoding(e) => write!(f, "token encoding failed: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::Encoding(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Token error"),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Claims carried by identity tokens issued by the platform's auth service
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub exp: usize,
}

impl From<Claims> for UserInfo {
    fn from(claims: Claims) -> Self {
        UserInfo {
            id: claims.sub,
            username: claims.name,
            avatar: claims.avatar,
        }
    }
}
