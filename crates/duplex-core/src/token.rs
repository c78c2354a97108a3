//! Compact HS256 tokens.
//!
//! Tokens use the JWT compact layout `header.payload.signature`, each part
//! base64url encoded without padding. The signature is HMAC-SHA256 over
//! `header.payload`, keyed with a [`Secret`].
//!
//! A payload may carry an `exp` claim (unix seconds); [`verify`] rejects the
//! token once it has passed. [`decode`] reads the payload without checking
//! anything and must only be used for logging or routing decisions.

use crate::{Error, Result, Secret};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// The only supported algorithm.
pub const ALGORITHM: &str = "HS256";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

struct Parts<'a> {
    header: &'a str,
    payload: &'a str,
    signature: &'a str,
}

impl<'a> Parts<'a> {
    fn split(token: &'a str) -> Result<Self> {
        let mut segments = token.split('.');
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(header), Some(payload), Some(signature), None)
                if !header.is_empty() && !payload.is_empty() =>
            {
                Ok(Self {
                    header,
                    payload,
                    signature,
                })
            }
            _ => Err(Error::InvalidToken("expected three segments".to_string())),
        }
    }

    fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.payload)
    }
}

/// Sign claims into a token.
pub fn sign<T: Serialize>(claims: &T, secret: &Secret) -> Result<String> {
    let header = Header {
        alg: ALGORITHM.to_string(),
        typ: Some("JWT".to_string()),
    };
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header}.{payload}");
    let signature = mac(secret, signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

/// Verify a token's signature and expiry, then decode its claims.
pub fn verify<T: DeserializeOwned>(token: &str, secret: &Secret) -> Result<T> {
    verify_at(token, secret, Utc::now().timestamp())
}

/// Like [`verify`], with an explicit "now" in unix seconds.
pub fn verify_at<T: DeserializeOwned>(token: &str, secret: &Secret, now: i64) -> Result<T> {
    let parts = Parts::split(token)?;

    let header: Header = decode_segment(parts.header)?;
    if header.alg != ALGORITHM {
        return Err(Error::InvalidToken(format!(
            "unsupported algorithm {}",
            header.alg
        )));
    }

    let presented = URL_SAFE_NO_PAD
        .decode(parts.signature)
        .map_err(|_| Error::InvalidSignature)?;
    let expected = mac(secret, parts.signing_input().as_bytes())?;
    if presented.as_slice().ct_eq(expected.as_slice()).unwrap_u8() != 1 {
        return Err(Error::InvalidSignature);
    }

    let payload: serde_json::Value = decode_segment(parts.payload)?;
    if let Some(exp) = payload.get("exp").and_then(serde_json::Value::as_i64)
        && now >= exp
    {
        return Err(Error::TokenExpired);
    }

    Ok(serde_json::from_value(payload)?)
}

/// Decode a token's claims without verifying anything.
pub fn decode<T: DeserializeOwned>(token: &str) -> Result<T> {
    let parts = Parts::split(token)?;
    decode_segment(parts.payload)
}

/// Compare two tokens in constant time.
pub fn tokens_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).unwrap_u8() == 1
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::InvalidToken(e.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn mac(secret: &Secret, message: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).map_err(|_| Error::InvalidSecret)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}
