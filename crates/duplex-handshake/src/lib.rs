//! Two-phase handshake for authorized full-duplex channels.
//!
//! A client (the [`Initiator`]) first asks for authorization over a
//! short-lived channel. The server (the [`Authority`]) verifies its identity
//! token, records a pending connection and answers with a session key. The
//! client then opens a second channel carrying that key; the authority
//! matches it against the pending entry and promotes it to an open
//! connection.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use duplex_core::{IdentityClaims, Secret};
//! use duplex_handshake::{Authority, AuthorityConfig, Initiator, InitiatorConfig, MemoryNetwork};
//!
//! # async fn run() -> duplex_handshake::Result<()> {
//! let secret = Secret::from("shared-secret");
//! let network = MemoryNetwork::new();
//!
//! let authority = Arc::new(Authority::new(AuthorityConfig::new(secret.clone())));
//! tokio::spawn(Arc::clone(&authority).serve(network.listen("mem://server")));
//!
//! let token = IdentityClaims::new("u1").sign(&secret)?;
//! let client = Initiator::new(network, InitiatorConfig::new("mem://server"), token)?;
//! let response = client.request_connection().await?;
//! assert!(!response.timed_out);
//!
//! client.connect().await?;
//! client.send("hello")?;
//! # Ok(())
//! # }
//! ```

pub mod authority;
pub mod correlator;
pub mod error;
pub mod events;
pub mod initiator;
pub mod messages;
pub mod store;
pub mod transport;

mod sync;

pub use authority::{Authority, AuthorityConfig, Authorization, Authorizer, TokenAuthorizer};
pub use correlator::{Correlator, RetryPolicy};
pub use error::{HandshakeError, Result};
pub use events::{Event, EventRegistry, SystemEvent};
pub use initiator::{ConnectionResponse, Initiator, InitiatorConfig};
pub use messages::{Reply, RequestEnvelope};
pub use store::{ConnectionStore, OpenConnection, PendingConnection};
pub use transport::{
    Acceptor, Channel, ChannelHandle, ConnectRequest, Connector, Frame, HandshakeInfo,
    MemoryNetwork, TransportError,
};
