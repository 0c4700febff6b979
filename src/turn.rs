#![forbid(unsafe_code)]

// TURN credential generation for coturn time-limited credentials.
// Uses HMAC-SHA1 per the TURN REST API (coturn --use-auth-secret).

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// TURN server configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// TURN server URLs (e.g. ["turn:example.com:3478", "turns:example.com:5349"])
    pub urls: Vec<String>,
    /// Shared secret for generating time-limited credentials
    pub secret: String,
    /// Credential TTL in seconds
    pub ttl_secs: u64,
}

/// ICE server entry handed to clients in `welcome`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnConfig {
    /// Builds a config from a comma separated URL list. Returns None when
    /// either the URLs or the secret are missing.
    pub fn new(urls: Option<&str>, secret: Option<&str>, ttl_secs: u64) -> Option<Self> {
        let urls: Vec<String> = urls?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let secret = secret?.to_string();
        if urls.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self { urls, secret, ttl_secs })
    }

    /// Generate time-limited credentials for a connection.
    ///
    /// coturn format: username = "expiry_timestamp:arbitrary_id"
    ///               credential = base64(HMAC-SHA1(secret, username))
    pub fn generate_credentials(&self, connection_id: &str) -> IceServer {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.ttl_secs;
        self.credentials_with_expiry(connection_id, expiry)
    }

    fn credentials_with_expiry(&self, connection_id: &str, expiry: u64) -> IceServer {
        let username = format!("{expiry}:{connection_id}");

        // HMAC accepts keys of any length, so new_from_slice cannot fail here
        let credential = match HmacSha1::new_from_slice(self.secret.as_bytes()) {
            Ok(mut mac) => {
                mac.update(username.as_bytes());
                Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
            }
            Err(_) => None,
        };

        IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_settings_disable_turn() {
        assert!(TurnConfig::new(None, Some("s"), 60).is_none());
        assert!(TurnConfig::new(Some("turn:a:3478"), None, 60).is_none());
        assert!(TurnConfig::new(Some(" , "), Some("s"), 60).is_none());
    }

    #[test]
    fn test_url_list_is_trimmed() {
        let tc = TurnConfig::new(Some("turn:a:3478, turns:a:5349"), Some("secret"), 60).unwrap();
        assert_eq!(tc.urls, vec!["turn:a:3478".to_string(), "turns:a:5349".to_string()]);
    }

    #[test]
    fn test_credential_format() {
        let tc = TurnConfig::new(Some("turn:a:3478"), Some("secret"), 60).unwrap();
        let server = tc.credentials_with_expiry("conn-1", 1_700_000_000);
        assert_eq!(server.username.as_deref(), Some("1700000000:conn-1"));

        let mut mac = HmacSha1::new_from_slice(b"secret").unwrap();
        mac.update(b"1700000000:conn-1");
        let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(server.credential, Some(expected));
    }
}
