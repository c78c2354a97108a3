//! # Duplex
//!
//! Two-phase token handshake for authorized full-duplex channels.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use duplex::{IdentityClaims, Secret};
//!
//! // Issue an identity token for a client
//! let secret = Secret::generate();
//! let token = IdentityClaims::new("u1").sign(&secret).unwrap();
//! println!("token: {}", token);
//! ```
//!
//! ## Modules
//!
//! - [`core`] - Token signing, claims and identifiers
//! - [`handshake`] - Request/verify/reconnect handshake, authority and initiator
//!
//! ## Re-exports
//!
//! Common types are re-exported at the crate root for convenience.

pub use duplex_core as core;
pub use duplex_handshake as handshake;

// Re-export common types at root
pub use duplex_core::{IdentityClaims, Secret, SessionClaims};
pub use duplex_handshake::{
    Authority, AuthorityConfig, HandshakeError, Initiator, InitiatorConfig, MemoryNetwork, Result,
    RetryPolicy,
};
