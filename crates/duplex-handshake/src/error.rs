//! Error types for the handshake.

use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Identity or session token failed verification.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Presented session key differs from the pending one.
    #[error("Session key does not match pending connection for {uid}")]
    Integrity { uid: String },

    #[error("No pending connection for {uid}")]
    StalePhaseTwo { uid: String },

    #[error("Pending connection for {uid} expired")]
    PendingExpired { uid: String },

    #[error("Connection rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Authorization key required")]
    AuthorizationRequired,

    #[error("Not connected")]
    NotConnected,

    #[error("Event name is reserved: {0}")]
    ReservedEvent(String),

    #[error("Message id already outstanding: {0}")]
    DuplicateMid(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Core error: {0}")]
    Core(#[from] duplex_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HandshakeError>;
