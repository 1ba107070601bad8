use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::IdempotencyError;

const MAX_KEY_LEN: usize = 255;

/// A client-supplied idempotency key.
///
/// Keys are 1 to 255 visible ASCII characters. The system never generates
/// keys on the client's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validates and wraps a key.
    pub fn new(key: impl Into<String>) -> Result<Self, IdempotencyError> {
        let key = key.into();
        if key.is_empty() {
            return Err(IdempotencyError::InvalidKey("key is empty".to_string()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(IdempotencyError::InvalidKey(format!(
                "key is {} bytes, maximum is {MAX_KEY_LEN}",
                key.len()
            )));
        }
        if !key.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(IdempotencyError::InvalidKey(
                "key must contain only visible ASCII characters".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = IdempotencyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

/// A fingerprint of the request content a key was first used with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Wraps a fingerprint computed by the caller.
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self(fingerprint.into())
    }

    /// Computes a SHA-256 fingerprint over the request method, path and body.
    pub fn of(method: &str, path: &str, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
        hasher.update(body);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Returns the fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A response exactly as it was first returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize>(status: u16, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            status,
            body: serde_json::to_vec(value)?,
        })
    }
}

/// A committed idempotency record. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub fingerprint: RequestFingerprint,
    pub response: StoredResponse,
    pub stored_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Returns true if this record was stored for the given request content.
    pub fn matches(&self, fingerprint: &RequestFingerprint) -> bool {
        &self.fingerprint == fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(IdempotencyKey::new("abc").is_ok());
        assert!(IdempotencyKey::new("").is_err());
        assert!(IdempotencyKey::new("has space").is_err());
        assert!(IdempotencyKey::new("x".repeat(256)).is_err());
        assert!(IdempotencyKey::new("x".repeat(255)).is_ok());
    }

    #[test]
    fn key_deserialization_validates() {
        let ok: IdempotencyKey = serde_json::from_str("\"order-42\"").unwrap();
        assert_eq!(ok.as_str(), "order-42");
        assert!(serde_json::from_str::<IdempotencyKey>("\"\"").is_err());
    }

    #[test]
    fn fingerprint_depends_on_every_part() {
        let base = RequestFingerprint::of("POST", "/orders", b"{\"qty\":1}");
        assert_eq!(base, RequestFingerprint::of("POST", "/orders", b"{\"qty\":1}"));
        assert_ne!(base, RequestFingerprint::of("PUT", "/orders", b"{\"qty\":1}"));
        assert_ne!(base, RequestFingerprint::of("POST", "/orders/1", b"{\"qty\":1}"));
        assert_ne!(base, RequestFingerprint::of("POST", "/orders", b"{\"qty\":2}"));
        assert_eq!(base.as_str().len(), 64);
    }

    #[test]
    fn json_response_body() {
        let response =
            StoredResponse::json(201, &serde_json::json!({"order_id": "o-1"})).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, br#"{"order_id":"o-1"}"#.to_vec());
    }
}
