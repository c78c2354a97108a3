//! # duplex-core
//!
//! Credential primitives for the duplex handshake.
//!
//! This crate provides:
//! - Compact HS256 token signing and verification
//! - Identity token and session-key claims
//! - Shared secrets
//! - Correlation id generation

pub mod claims;
pub mod error;
pub mod id;
pub mod secret;
pub mod token;

pub use claims::{IdentityClaims, SESSION_KIND, SessionClaims};
pub use error::Error;
pub use secret::Secret;

/// Result type for duplex-core operations.
pub type Result<T> = std::result::Result<T, Error>;
