//! Identity and session-key claims.

use crate::{Error, Result, Secret, id, token};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// `kind` claim carried by every session key.
pub const SESSION_KIND: &str = "session";

/// Claims carried by an identity token.
///
/// Identity tokens are issued outside the handshake; the handshake only
/// verifies them and reads `uid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl IdentityClaims {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            iat: Some(Utc::now().timestamp()),
            exp: None,
            kind: None,
        }
    }

    /// Verify an identity token.
    ///
    /// Session keys share the token format but are refused here, so a key
    /// can never be traded in for another one.
    pub fn verify(token: &str, secret: &Secret) -> Result<Self> {
        let claims: Self = token::verify(token, secret)?;
        if claims.is_session_key() {
            return Err(Error::InvalidToken(
                "session key is not an identity token".to_string(),
            ));
        }
        Ok(claims)
    }

    pub fn is_session_key(&self) -> bool {
        self.kind.as_deref() == Some(SESSION_KIND)
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        let issued = self.iat.unwrap_or_else(|| Utc::now().timestamp());
        self.exp = Some(issued + ttl.num_seconds());
        self
    }

    /// Sign these claims into an identity token.
    pub fn sign(&self, secret: &Secret) -> Result<String> {
        token::sign(self, secret)
    }
}

/// Claims carried by a session key.
///
/// A session key binds a `uid` to the identity token it was issued for.
/// It authorizes exactly one phase-2 connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub uid: String,
    #[serde(rename = "originalToken")]
    pub original_token: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub jti: String,
    pub kind: String,
}

impl SessionClaims {
    pub fn new(
        uid: impl Into<String>,
        original_token: impl Into<String>,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            uid: uid.into(),
            original_token: original_token.into(),
            iat: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
            jti: id::key_id(),
            kind: SESSION_KIND.to_string(),
        }
    }

    /// Mint the session key.
    pub fn sign(&self, secret: &Secret) -> Result<String> {
        token::sign(self, secret)
    }
}
