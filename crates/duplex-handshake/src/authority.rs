//! Server side of the handshake.
//!
//! Every accepted connection is either a phase-1 request channel or a
//! phase-2 data channel, decided by whether it was opened with an `auth`
//! parameter.
//!
//! Phase 1: the client sends a `request_connection` frame. The authority
//! validates the identity token through its [`Authorizer`], mints a session
//! key, records a [`PendingConnection`], replies and disconnects. Phase-1
//! channels never stay open.
//!
//! Phase 2: the client connects with `auth=<session key>`. The key must
//! verify and must equal the pending key for its uid; the pending entry is
//! then consumed and an [`OpenConnection`] recorded. Anything else
//! disconnects.

use crate::error::{HandshakeError, Result};
use crate::events::{Event, EventRegistry, SystemEvent, SystemEvents};
use crate::messages::{EVENT_REQUEST_CONNECTION, METHOD_REQUEST_CONNECTION, Reply, RequestEnvelope};
use crate::store::{ConnectionStore, OpenConnection, PendingConnection, PruneReport};
use crate::sync::lock;
use crate::transport::{Acceptor, Channel, ChannelHandle, Frame, HandshakeInfo, Inbound};
use chrono::{DateTime, Duration, Utc};
use duplex_core::{IdentityClaims, Secret, SessionClaims, token};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection parameter carrying the session key in phase 2.
pub const AUTH_PARAM: &str = "auth";

/// Reason sent to rejected clients when details are withheld.
pub const GENERIC_REJECTION: &str = "unauthorized";

/// Authority configuration.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Secret shared with whoever issues identity tokens.
    pub secret: Secret,
    /// Lifetime of a minted session key.
    pub session_key_ttl: Duration,
    /// How long a pending connection waits for its phase-2 channel.
    pub pending_ttl: Duration,
    /// How long a phase-1 channel may stay silent.
    pub request_timeout: std::time::Duration,
    /// Send the verification failure as the rejection reason.
    pub expose_rejection_reason: bool,
}

impl AuthorityConfig {
    pub fn new(secret: Secret) -> Self {
        Self {
            secret,
            session_key_ttl: Duration::minutes(5),
            pending_ttl: Duration::minutes(5),
            request_timeout: std::time::Duration::from_secs(10),
            expose_rejection_reason: true,
        }
    }

    pub fn with_session_key_ttl(mut self, ttl: Duration) -> Self {
        self.session_key_ttl = ttl;
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn with_request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_exposed_reasons(mut self, expose: bool) -> Self {
        self.expose_rejection_reason = expose;
        self
    }
}

/// Outcome of identity validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub success: bool,
    pub reason: Option<String>,
}

impl Authorization {
    pub fn granted() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decides whether a phase-1 request may proceed.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, envelope: &RequestEnvelope) -> Authorization;
}

/// Verifies the identity token against the shared secret.
#[derive(Debug, Clone)]
pub struct TokenAuthorizer {
    secret: Secret,
}

impl TokenAuthorizer {
    pub fn new(secret: Secret) -> Self {
        Self { secret }
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, envelope: &RequestEnvelope) -> Authorization {
        match IdentityClaims::verify(&envelope.headers.authorization, &self.secret) {
            Ok(_) => Authorization::granted(),
            Err(e) => Authorization::denied(e.to_string()),
        }
    }
}

/// A phase-1 request that was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub uid: String,
    pub reply: Reply,
}

/// Pending and open counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub pending: usize,
    pub open: usize,
}

/// Server role of the handshake.
pub struct Authority {
    config: AuthorityConfig,
    authorizer: Arc<dyn Authorizer>,
    store: Mutex<ConnectionStore>,
    server_events: SystemEvents,
    client_events: EventRegistry,
}

impl Authority {
    pub fn new(config: AuthorityConfig) -> Self {
        let authorizer = Arc::new(TokenAuthorizer::new(config.secret.clone()));
        Self {
            config,
            authorizer,
            store: Mutex::new(ConnectionStore::new()),
            server_events: SystemEvents::default(),
            client_events: EventRegistry::new(),
        }
    }

    /// Replace the default [`TokenAuthorizer`].
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn register_server_event(
        &self,
        event: SystemEvent,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        self.server_events.register(event, callback);
    }

    /// Observe inbound data-channel frames named `name`.
    pub fn register_client_event(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<()> {
        self.client_events.register(name, callback)
    }

    /// Accept connections until the acceptor is exhausted.
    pub async fn serve<A: Acceptor>(self: Arc<Self>, mut acceptor: A) {
        while let Some(channel) = acceptor.accept().await {
            let authority = Arc::clone(&self);
            tokio::spawn(async move { authority.handle_connection(channel).await });
        }
        debug!("Acceptor closed");
    }

    /// Run one accepted connection to completion.
    pub async fn handle_connection(&self, channel: Channel) {
        let (handle, inbound, info) = channel.into_parts();
        info!(channel = %info.channel_id, peer = ?info.peer_addr, "Connection received");
        self.server_events.emit(
            SystemEvent::Connection,
            &SystemEvent::Connection.event().with_channel(handle.id()),
        );

        match info.param(AUTH_PARAM).map(str::to_string) {
            Some(key) => match self.admit(&key, &handle, &info) {
                Ok(connection) => self.run_data_channel(connection.uid, handle, inbound).await,
                Err(e) => {
                    warn!(channel = %info.channel_id, "Refused phase-2 connection: {}", e);
                    handle.disconnect();
                }
            },
            None => self.run_request_channel(handle, inbound).await,
        }
    }

    /// Phase 2: promote the pending connection matching `key`.
    pub fn admit(
        &self,
        key: &str,
        handle: &ChannelHandle,
        info: &HandshakeInfo,
    ) -> Result<OpenConnection> {
        let claimed = token::decode::<SessionClaims>(key).map(|claims| claims.uid);

        let claims: SessionClaims = match token::verify(key, &self.config.secret) {
            Ok(claims) => claims,
            Err(e) => {
                match &claimed {
                    Ok(uid) => warn!(%uid, "Received authorized connection, but key is invalid: {}", e),
                    Err(_) => warn!("Received authorized connection with an undecodable key: {}", e),
                }
                return Err(HandshakeError::Validation(e.to_string()));
            }
        };

        let promotion = self.lock_store().promote(
            &claims.uid,
            key,
            handle.clone(),
            info.clone(),
            Utc::now(),
        )?;

        if let Some(previous) = promotion.replaced {
            info!(uid = %previous.uid, channel = %previous.channel.id(), "Replacing open connection");
            previous.channel.disconnect();
        }

        info!(uid = %claims.uid, channel = %handle.id(), "Received authorized connection");
        self.server_events.emit(
            SystemEvent::Promoted,
            &SystemEvent::Promoted
                .event()
                .with_uid(claims.uid.as_str())
                .with_channel(handle.id()),
        );
        Ok(promotion.connection)
    }

    /// Phase 1: answer one request frame.
    ///
    /// Returns `None` for frames that are not a parsable `request_connection`
    /// envelope; those are ignored.
    pub fn handle_request(&self, handle: &ChannelHandle, raw: &str) -> Option<RequestOutcome> {
        let envelope: RequestEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring malformed request: {}", e);
                return None;
            }
        };
        if envelope.method != METHOD_REQUEST_CONNECTION {
            return None;
        }

        info!(uid = %envelope.uid, mid = %envelope.mid, "Request connection received");

        let reply = match self.issue(&envelope, handle, Utc::now()) {
            Ok(key) => {
                info!(uid = %envelope.uid, "Request connection approved");
                Reply::verified(envelope.mid.as_str(), key)
            }
            Err(e) => {
                info!(uid = %envelope.uid, "Request connection rejected: {}", e);
                let reason = if self.config.expose_rejection_reason {
                    e.to_string()
                } else {
                    GENERIC_REJECTION.to_string()
                };
                Reply::rejected(envelope.mid.as_str(), reason)
            }
        };

        Some(RequestOutcome {
            uid: envelope.uid,
            reply,
        })
    }

    fn issue(
        &self,
        envelope: &RequestEnvelope,
        handle: &ChannelHandle,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let authorization = self.authorizer.authorize(envelope);
        if !authorization.success {
            return Err(HandshakeError::Validation(
                authorization
                    .reason
                    .unwrap_or_else(|| GENERIC_REJECTION.to_string()),
            ));
        }

        let token = envelope.headers.authorization.as_str();
        let identity: IdentityClaims = token::decode(token)?;
        if identity.is_session_key() {
            return Err(HandshakeError::Validation(
                "session key is not an identity token".to_string(),
            ));
        }
        if identity.uid != envelope.uid {
            return Err(HandshakeError::Validation(
                "uid does not match identity token".to_string(),
            ));
        }

        let session_key = SessionClaims::new(
            identity.uid.as_str(),
            token,
            now,
            self.config.session_key_ttl,
        )
        .sign(&self.config.secret)?;

        let previous = self.lock_store().insert_pending(PendingConnection {
            uid: identity.uid.clone(),
            channel: handle.clone(),
            session_key: session_key.clone(),
            token: token.to_string(),
            issued_at: now,
            expires_at: now + self.config.pending_ttl,
        });
        if previous.is_some() {
            debug!(uid = %identity.uid, "Replaced pending connection");
        }

        Ok(session_key)
    }

    async fn run_request_channel(&self, handle: ChannelHandle, mut inbound: Inbound) {
        let deadline = tokio::time::sleep(self.config.request_timeout);
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                frame = inbound.recv() => frame,
                _ = &mut deadline => {
                    debug!(channel = %handle.id(), "No request before timeout");
                    None
                }
            };
            let Some(frame) = frame else {
                break;
            };
            if frame.event != EVENT_REQUEST_CONNECTION {
                debug!(channel = %handle.id(), event = %frame.event, "Ignoring frame on request channel");
                continue;
            }
            let Some(outcome) = self.handle_request(&handle, &frame.data) else {
                continue;
            };

            match serde_json::to_string(&outcome.reply) {
                Ok(reply) => {
                    if let Err(e) = handle.send(Frame::message(reply.as_str())) {
                        warn!(uid = %outcome.uid, "Failed to send reply: {}", e);
                    }
                    self.server_events.emit(
                        SystemEvent::RequestConnection,
                        &SystemEvent::RequestConnection
                            .event()
                            .with_uid(outcome.uid.as_str())
                            .with_channel(handle.id())
                            .with_payload(reply),
                    );
                }
                Err(e) => warn!(uid = %outcome.uid, "Failed to encode reply: {}", e),
            }
            break;
        }

        // The data channel is opened separately.
        handle.disconnect();
    }

    async fn run_data_channel(&self, uid: String, handle: ChannelHandle, mut inbound: Inbound) {
        while let Some(frame) = inbound.recv().await {
            let event = Event::new(frame.event)
                .with_uid(uid.as_str())
                .with_channel(handle.id())
                .with_payload(frame.data);
            if !self.client_events.dispatch(&event) {
                debug!(%uid, event = %event.name, "No handler for event");
            }
        }

        handle.disconnect();
        if self.lock_store().remove_open(&uid, handle.id()).is_some() {
            info!(%uid, "Open connection closed");
        }
        self.server_events.emit(
            SystemEvent::Disconnect,
            &SystemEvent::Disconnect
                .event()
                .with_uid(uid.as_str())
                .with_channel(handle.id()),
        );
    }

    /// Send `message` to every connected open channel.
    ///
    /// Disconnected entries are skipped, not removed. Returns how many sends
    /// succeeded.
    pub fn broadcast(&self, message: &str) -> usize {
        let channels: Vec<ChannelHandle> = self
            .lock_store()
            .open_connections()
            .filter(|connection| connection.channel.is_connected())
            .map(|connection| connection.channel.clone())
            .collect();

        channels
            .iter()
            .filter(|channel| channel.send(Frame::message(message)).is_ok())
            .count()
    }

    /// Send `message` to one open connection.
    pub fn send_to(&self, uid: &str, message: &str) -> Result<()> {
        let channel = self
            .lock_store()
            .open(uid)
            .map(|connection| connection.channel.clone())
            .ok_or(HandshakeError::NotConnected)?;
        channel.send(Frame::message(message))?;
        Ok(())
    }

    /// Close the open connection for `uid`.
    pub fn close(&self, uid: &str) -> bool {
        match self.lock_store().close(uid) {
            Some(connection) => {
                connection.channel.disconnect();
                true
            }
            None => false,
        }
    }

    /// Close every open connection.
    pub fn close_all(&self) -> usize {
        let connections = self.lock_store().drain_open();
        for connection in &connections {
            connection.channel.disconnect();
        }
        connections.len()
    }

    /// Drop expired pending entries and disconnected open entries.
    pub fn prune(&self, now: DateTime<Utc>) -> PruneReport {
        let report = self.lock_store().prune(now);
        if report != PruneReport::default() {
            info!(
                expired_pending = report.expired_pending,
                stale_open = report.stale_open,
                "Pruned connections"
            );
        }
        report
    }

    /// Call [`Authority::prune`] every `every`.
    pub fn spawn_pruner(self: &Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        let authority = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            loop {
                ticks.tick().await;
                authority.prune(Utc::now());
            }
        })
    }

    pub fn pending(&self, uid: &str) -> Option<PendingConnection> {
        self.lock_store().pending(uid).cloned()
    }

    pub fn open(&self, uid: &str) -> Option<OpenConnection> {
        self.lock_store().open(uid).cloned()
    }

    pub fn stats(&self) -> Stats {
        let store = self.lock_store();
        Stats {
            pending: store.pending_count(),
            open: store.open_count(),
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, ConnectionStore> {
        lock(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::codes;
    use crate::transport::pair;
    use std::collections::BTreeMap;

    fn secret() -> Secret {
        Secret::from("authority-test")
    }

    fn authority() -> Authority {
        Authority::new(AuthorityConfig::new(secret()))
    }

    fn handle() -> (ChannelHandle, Channel) {
        let (ours, peer) = pair(HandshakeInfo::new(None, BTreeMap::new()));
        (ours.handle().clone(), peer)
    }

    fn phase_two_info(key: &str) -> HandshakeInfo {
        let mut query = BTreeMap::new();
        query.insert(AUTH_PARAM.to_string(), key.to_string());
        HandshakeInfo::new(None, query)
    }

    fn request(uid: &str, token: &str) -> String {
        serde_json::to_string(&RequestEnvelope::new(uid, token).with_mid("abc123")).unwrap()
    }

    #[test]
    fn test_valid_request_creates_pending() {
        let authority = authority();
        let (handle, _peer) = handle();
        let token = IdentityClaims::new("u1").sign(&secret()).unwrap();

        let outcome = authority.handle_request(&handle, &request("u1", &token)).unwrap();

        assert_eq!(outcome.reply.code, codes::VERIFIED);
        assert_eq!(outcome.reply.mid, "abc123");
        let key = outcome.reply.key.unwrap();

        let pending = authority.pending("u1").unwrap();
        assert_eq!(pending.session_key, key);
        assert_eq!(pending.token, token);

        let claims: SessionClaims = token::verify(&key, &secret()).unwrap();
        assert_eq!(claims.uid, "u1");
        assert_eq!(claims.original_token, token);
    }

    #[test]
    fn test_invalid_token_rejected_without_state() {
        let authority = authority();
        let (handle, _peer) = handle();
        let forged = IdentityClaims::new("u1").sign(&Secret::from("wrong")).unwrap();

        let outcome = authority.handle_request(&handle, &request("u1", &forged)).unwrap();

        assert_eq!(outcome.reply.code, codes::REJECTED);
        assert_eq!(outcome.reply.response, codes::RESPONSE_REJECTED);
        assert!(outcome.reply.reason.unwrap().contains("Invalid signature"));
        assert!(authority.pending("u1").is_none());
    }

    #[test]
    fn test_session_key_cannot_renew_itself() {
        let authority = authority();
        let (handle, _peer) = handle();
        let token = IdentityClaims::new("u1").sign(&secret()).unwrap();

        let outcome = authority.handle_request(&handle, &request("u1", &token)).unwrap();
        let key = outcome.reply.key.unwrap();

        let outcome = authority.handle_request(&handle, &request("u1", &key)).unwrap();
        assert_eq!(outcome.reply.code, codes::REJECTED);
        assert!(outcome.reply.key.is_none());
        assert!(outcome.reply.reason.unwrap().contains("session key"));

        // The pending key from the first request is untouched.
        assert_eq!(authority.pending("u1").unwrap().session_key, key);
    }

    #[test]
    fn test_session_key_refused_by_custom_authorizer_path() {
        struct AllowAll;
        impl Authorizer for AllowAll {
            fn authorize(&self, _: &RequestEnvelope) -> Authorization {
                Authorization::granted()
            }
        }

        let authority = authority().with_authorizer(Arc::new(AllowAll));
        let (handle, _peer) = handle();
        let key = SessionClaims::new("u1", "tok", Utc::now(), Duration::minutes(1))
            .sign(&secret())
            .unwrap();

        let outcome = authority.handle_request(&handle, &request("u1", &key)).unwrap();
        assert_eq!(outcome.reply.code, codes::REJECTED);
        assert!(authority.pending("u1").is_none());
    }

    #[test]
    fn test_hidden_rejection_reason() {
        let authority = Authority::new(AuthorityConfig::new(secret()).with_exposed_reasons(false));
        let (handle, _peer) = handle();

        let outcome = authority.handle_request(&handle, &request("u1", "garbage")).unwrap();
        assert_eq!(outcome.reply.reason.as_deref(), Some(GENERIC_REJECTION));
    }

    #[test]
    fn test_uid_must_match_token() {
        let authority = authority();
        let (handle, _peer) = handle();
        let token = IdentityClaims::new("u1").sign(&secret()).unwrap();

        let outcome = authority.handle_request(&handle, &request("u2", &token)).unwrap();
        assert_eq!(outcome.reply.code, codes::REJECTED);
        assert_eq!(authority.stats(), Stats::default());
    }

    #[test]
    fn test_other_methods_ignored() {
        let authority = authority();
        let (handle, _peer) = handle();
        let mut envelope = RequestEnvelope::new("u1", "T");
        envelope.method = "something_else".to_string();

        assert!(authority
            .handle_request(&handle, &serde_json::to_string(&envelope).unwrap())
            .is_none());
        assert!(authority.handle_request(&handle, "not json").is_none());
    }

    #[test]
    fn test_custom_authorizer() {
        struct DenyAll;
        impl Authorizer for DenyAll {
            fn authorize(&self, _: &RequestEnvelope) -> Authorization {
                Authorization::denied("closed for maintenance")
            }
        }

        let authority = authority().with_authorizer(Arc::new(DenyAll));
        let (handle, _peer) = handle();
        let token = IdentityClaims::new("u1").sign(&secret()).unwrap();

        let outcome = authority.handle_request(&handle, &request("u1", &token)).unwrap();
        assert_eq!(outcome.reply.reason.as_deref(), Some("Validation failed: closed for maintenance"));
        assert!(authority.pending("u1").is_none());
    }

    #[test]
    fn test_admit_round_trip() {
        let authority = authority();
        let (phase_one, _p1) = handle();
        let token = IdentityClaims::new("u1").sign(&secret()).unwrap();
        let key = authority
            .handle_request(&phase_one, &request("u1", &token))
            .unwrap()
            .reply
            .key
            .unwrap();

        let (phase_two, _p2) = handle();
        let connection = authority.admit(&key, &phase_two, &phase_two_info(&key)).unwrap();

        assert_eq!(connection.uid, "u1");
        assert!(authority.pending("u1").is_none());
        assert_eq!(authority.open("u1").unwrap().channel.id(), phase_two.id());
        assert_eq!(authority.broadcast("hi"), 1);
    }

    #[test]
    fn test_admit_mismatched_key() {
        let authority = authority();
        let (phase_one, _p1) = handle();
        let token = IdentityClaims::new("u1").sign(&secret()).unwrap();
        authority.handle_request(&phase_one, &request("u1", &token)).unwrap();

        // Valid signature, different key.
        let other = SessionClaims::new("u1", "other", Utc::now(), Duration::minutes(1))
            .sign(&secret())
            .unwrap();
        let (phase_two, _p2) = handle();
        let result = authority.admit(&other, &phase_two, &phase_two_info(&other));

        assert!(matches!(result, Err(HandshakeError::Integrity { .. })));
        assert!(authority.pending("u1").is_some());
        assert!(authority.open("u1").is_none());
    }

    #[test]
    fn test_admit_forged_key() {
        let authority = authority();
        let forged = SessionClaims::new("u1", "t", Utc::now(), Duration::minutes(1))
            .sign(&Secret::from("wrong"))
            .unwrap();
        let (phase_two, _p2) = handle();

        let result = authority.admit(&forged, &phase_two, &phase_two_info(&forged));
        assert!(matches!(result, Err(HandshakeError::Validation(_))));

        let result = authority.admit("not-a-key", &phase_two, &phase_two_info("not-a-key"));
        assert!(matches!(result, Err(HandshakeError::Validation(_))));
    }

    #[test]
    fn test_admit_unsolicited() {
        let authority = authority();
        let key = SessionClaims::new("u1", "t", Utc::now(), Duration::minutes(1))
            .sign(&secret())
            .unwrap();
        let (phase_two, _p2) = handle();

        let result = authority.admit(&key, &phase_two, &phase_two_info(&key));
        assert!(matches!(result, Err(HandshakeError::StalePhaseTwo { .. })));
    }

    #[test]
    fn test_broadcast_skips_disconnected() {
        let authority = authority();
        let mut keys = Vec::new();
        let mut peers = Vec::new();
        for uid in ["a", "b"] {
            let (phase_one, p1) = handle();
            let token = IdentityClaims::new(uid).sign(&secret()).unwrap();
            let key = authority
                .handle_request(&phase_one, &request(uid, &token))
                .unwrap()
                .reply
                .key
                .unwrap();
            let (phase_two, p2) = handle();
            authority.admit(&key, &phase_two, &phase_two_info(&key)).unwrap();
            keys.push(phase_two);
            peers.push((p1, p2));
        }

        keys[0].disconnect();
        assert_eq!(authority.broadcast("hi"), 1);
        assert_eq!(authority.stats().open, 2);

        let report = authority.prune(Utc::now());
        assert_eq!(report.stale_open, 1);
        assert_eq!(authority.stats().open, 1);
    }

    #[test]
    fn test_close() {
        let authority = authority();
        let (phase_one, _p1) = handle();
        let token = IdentityClaims::new("u1").sign(&secret()).unwrap();
        let key = authority
            .handle_request(&phase_one, &request("u1", &token))
            .unwrap()
            .reply
            .key
            .unwrap();
        let (phase_two, _p2) = handle();
        authority.admit(&key, &phase_two, &phase_two_info(&key)).unwrap();

        assert!(authority.close("u1"));
        assert!(!phase_two.is_connected());
        assert!(!authority.close("u1"));
        assert_eq!(authority.close_all(), 0);
    }

    #[test]
    fn test_reserved_client_event() {
        let authority = authority();
        let result = authority.register_client_event("request_connection", |_| {});
        assert!(matches!(result, Err(HandshakeError::ReservedEvent(_))));
        authority.register_client_event("message", |_| {}).unwrap();
    }
}
