//! Phase-1 wire messages.

use duplex_core::id::message_id;
use serde::{Deserialize, Serialize};

/// Method name of a phase-1 request and its reply.
pub const METHOD_REQUEST_CONNECTION: &str = "request_connection";

/// Frame event carrying a phase-1 request.
pub const EVENT_REQUEST_CONNECTION: &str = "request_connection";

/// Frame event carrying replies and data-channel payloads.
pub const EVENT_MESSAGE: &str = "message";

/// Reply codes and response labels.
pub mod codes {
    pub const VERIFIED: u16 = 200;
    pub const REJECTED: u16 = 400;

    pub const RESPONSE_VERIFIED: &str = "verified";
    pub const RESPONSE_REJECTED: &str = "rejected";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Raw identity token.
    #[serde(default)]
    pub authorization: String,
}

/// Phase-1 request.
///
/// The `replied`, `response` and `timedout` fields are sent as their
/// initial values and are only meaningful on the initiator, where the
/// correlator updates them as the request resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    pub uid: String,
    pub headers: Headers,
    pub mid: String,
    #[serde(default)]
    pub replied: bool,
    #[serde(default)]
    pub response: Option<Reply>,
    #[serde(default)]
    pub timedout: bool,
}

impl RequestEnvelope {
    /// Create a request with a fresh message id.
    pub fn new(uid: impl Into<String>, authorization: impl Into<String>) -> Self {
        Self {
            method: METHOD_REQUEST_CONNECTION.to_string(),
            uid: uid.into(),
            headers: Headers {
                authorization: authorization.into(),
            },
            mid: message_id(),
            replied: false,
            response: None,
            timedout: false,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>) -> Self {
        self.mid = mid.into();
        self
    }

    /// Replied or timed out.
    pub fn is_resolved(&self) -> bool {
        self.replied || self.timedout
    }
}

/// Phase-1 reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub method: String,
    pub response: String,
    pub code: u16,
    pub mid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Reply {
    pub fn verified(mid: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            method: METHOD_REQUEST_CONNECTION.to_string(),
            response: codes::RESPONSE_VERIFIED.to_string(),
            code: codes::VERIFIED,
            mid: mid.into(),
            key: Some(key.into()),
            reason: None,
        }
    }

    pub fn rejected(mid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            method: METHOD_REQUEST_CONNECTION.to_string(),
            response: codes::RESPONSE_REJECTED.to_string(),
            code: codes::REJECTED,
            mid: mid.into(),
            key: None,
            reason: Some(reason.into()),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.code == codes::VERIFIED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let envelope = RequestEnvelope::new("u1", "T").with_mid("abc123");
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            value,
            json!({
                "method": "request_connection",
                "uid": "u1",
                "headers": {"authorization": "T"},
                "mid": "abc123",
                "replied": false,
                "response": null,
                "timedout": false
            })
        );
    }

    #[test]
    fn test_request_minimal_parse() {
        let envelope: RequestEnvelope = serde_json::from_str(
            r#"{"method":"request_connection","uid":"u1","mid":"abc123","headers":{"authorization":"T"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.headers.authorization, "T");
        assert!(!envelope.is_resolved());
    }

    #[test]
    fn test_missing_authorization_parses_empty() {
        let envelope: RequestEnvelope = serde_json::from_str(
            r#"{"method":"request_connection","uid":"u1","mid":"m","headers":{}}"#,
        )
        .unwrap();
        assert!(envelope.headers.authorization.is_empty());
    }

    #[test]
    fn test_reply_wire_format() {
        let verified = serde_json::to_value(Reply::verified("abc123", "K")).unwrap();
        assert_eq!(
            verified,
            json!({"method": "request_connection", "response": "verified", "code": 200, "mid": "abc123", "key": "K"})
        );

        let rejected = serde_json::to_value(Reply::rejected("abc123", "Invalid signature")).unwrap();
        assert_eq!(
            rejected,
            json!({"method": "request_connection", "response": "rejected", "code": 400, "mid": "abc123", "reason": "Invalid signature"})
        );
    }

    #[test]
    fn test_fresh_mids() {
        let a = RequestEnvelope::new("u1", "T");
        let b = RequestEnvelope::new("u1", "T");
        assert_eq!(a.mid.len(), 12);
        assert_ne!(a.mid, b.mid);
    }
}
