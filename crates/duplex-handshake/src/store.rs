//! Per-identity connection state.
//!
//! ```text
//! ABSENT ──valid request──> PENDING ──matching key──> OPEN ──close──> ABSENT
//!                              │
//!                              └─ mismatched key: stays PENDING until it
//!                                 expires or a new request replaces it
//! ```
//!
//! Each uid has at most one pending and at most one open entry.

use crate::error::{HandshakeError, Result};
use crate::transport::{ChannelHandle, HandshakeInfo};
use chrono::{DateTime, Utc};
use duplex_core::token::tokens_match;
use std::collections::HashMap;
use std::net::SocketAddr;
use uuid::Uuid;

/// An authorized identity that has not opened its data channel yet.
#[derive(Debug, Clone)]
pub struct PendingConnection {
    pub uid: String,
    /// The phase-1 channel the request arrived on.
    pub channel: ChannelHandle,
    pub session_key: String,
    /// The identity token the key was issued for.
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingConnection {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An established data channel.
#[derive(Debug, Clone)]
pub struct OpenConnection {
    pub uid: String,
    pub channel: ChannelHandle,
    pub peer_addr: Option<SocketAddr>,
    pub info: HandshakeInfo,
    pub session_key: String,
    pub established_at: DateTime<Utc>,
}

/// Result of a successful promotion.
#[derive(Debug)]
pub struct Promotion {
    pub connection: OpenConnection,
    /// The open connection this one displaced, if the uid was already open.
    pub replaced: Option<OpenConnection>,
}

/// Counts removed by [`ConnectionStore::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub expired_pending: usize,
    pub stale_open: usize,
}

/// Pending and open connections keyed by uid.
#[derive(Debug, Default)]
pub struct ConnectionStore {
    pending: HashMap<String, PendingConnection>,
    open: HashMap<String, OpenConnection>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending connection, replacing any previous one for the uid.
    pub fn insert_pending(&mut self, pending: PendingConnection) -> Option<PendingConnection> {
        self.pending.insert(pending.uid.clone(), pending)
    }

    pub fn pending(&self, uid: &str) -> Option<&PendingConnection> {
        self.pending.get(uid)
    }

    pub fn open(&self, uid: &str) -> Option<&OpenConnection> {
        self.open.get(uid)
    }

    /// Promote `uid` from pending to open.
    ///
    /// The presented key must equal the pending session key. On mismatch
    /// the pending entry is left as it was. On success the pending entry is
    /// consumed, so a key opens at most one connection.
    pub fn promote(
        &mut self,
        uid: &str,
        presented_key: &str,
        channel: ChannelHandle,
        info: HandshakeInfo,
        now: DateTime<Utc>,
    ) -> Result<Promotion> {
        let pending = self
            .pending
            .get(uid)
            .ok_or_else(|| HandshakeError::StalePhaseTwo {
                uid: uid.to_string(),
            })?;

        if pending.is_expired(now) {
            self.pending.remove(uid);
            return Err(HandshakeError::PendingExpired {
                uid: uid.to_string(),
            });
        }

        if !tokens_match(presented_key, &pending.session_key) {
            return Err(HandshakeError::Integrity {
                uid: uid.to_string(),
            });
        }

        let pending = self
            .pending
            .remove(uid)
            .ok_or_else(|| HandshakeError::StalePhaseTwo {
                uid: uid.to_string(),
            })?;

        let connection = OpenConnection {
            uid: pending.uid,
            channel,
            peer_addr: info.peer_addr,
            info,
            session_key: pending.session_key,
            established_at: now,
        };
        let replaced = self.open.insert(uid.to_string(), connection.clone());

        Ok(Promotion {
            connection,
            replaced,
        })
    }

    /// Remove the open entry for `uid` if it still belongs to `channel_id`.
    pub fn remove_open(&mut self, uid: &str, channel_id: Uuid) -> Option<OpenConnection> {
        if self.open.get(uid)?.channel.id() != channel_id {
            return None;
        }
        self.open.remove(uid)
    }

    pub fn close(&mut self, uid: &str) -> Option<OpenConnection> {
        self.open.remove(uid)
    }

    pub fn drain_open(&mut self) -> Vec<OpenConnection> {
        self.open.drain().map(|(_, connection)| connection).collect()
    }

    pub fn open_connections(&self) -> impl Iterator<Item = &OpenConnection> {
        self.open.values()
    }

    /// Drop expired pending entries and open entries whose channel is gone.
    pub fn prune(&mut self, now: DateTime<Utc>) -> PruneReport {
        let pending_before = self.pending.len();
        self.pending.retain(|_, pending| !pending.is_expired(now));

        let open_before = self.open.len();
        self.open
            .retain(|_, connection| connection.channel.is_connected());

        PruneReport {
            expired_pending: pending_before - self.pending.len(),
            stale_open: open_before - self.open.len(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
