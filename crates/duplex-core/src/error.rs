//! Error types for duplex-core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid secret")]
    InvalidSecret,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
