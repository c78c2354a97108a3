//! Client side of the handshake.

use crate::authority::AUTH_PARAM;
use crate::correlator::{Correlator, RetryPolicy};
use crate::error::{HandshakeError, Result};
use crate::events::{Event, EventRegistry};
use crate::messages::{EVENT_MESSAGE, METHOD_REQUEST_CONNECTION, Reply, RequestEnvelope};
use crate::sync::lock;
use crate::transport::{ChannelHandle, ConnectRequest, Connector, Frame, Inbound};
use duplex_core::{IdentityClaims, token};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Initiator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatorConfig {
    /// Where the authority listens.
    pub url: String,
    pub retry: RetryPolicy,
}

impl InitiatorConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of a phase-1 request that was not rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResponse {
    /// The reply's `response` label, `None` on timeout.
    pub response: Option<String>,
    pub timed_out: bool,
}

struct DataChannel {
    handle: ChannelHandle,
    dispatcher: JoinHandle<()>,
}

/// Client role of the handshake.
pub struct Initiator<C: Connector> {
    connector: C,
    config: InitiatorConfig,
    token: String,
    uid: String,
    correlator: Arc<Correlator>,
    session_key: Arc<Mutex<Option<String>>>,
    channel: Mutex<Option<DataChannel>>,
    events: Arc<EventRegistry>,
}

impl<C: Connector> Initiator<C> {
    /// Create an initiator for the identity in `token`.
    ///
    /// The token is decoded, not verified; only the authority holds the
    /// secret.
    pub fn new(connector: C, config: InitiatorConfig, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let claims: IdentityClaims = token::decode(&token)?;
        Ok(Self {
            connector,
            config,
            token,
            uid: claims.uid,
            correlator: Arc::new(Correlator::new()),
            session_key: Arc::new(Mutex::new(None)),
            channel: Mutex::new(None),
            events: Arc::new(EventRegistry::new()),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn config(&self) -> &InitiatorConfig {
        &self.config
    }

    /// Phase 1: ask the authority for a session key.
    ///
    /// Resolves once a reply arrives or the retry budget runs out. A
    /// verified reply stores the session key; a rejection is an error.
    pub async fn request_connection(&self) -> Result<ConnectionResponse> {
        let channel = self
            .connector
            .connect(ConnectRequest::new(self.config.url.as_str()))
            .await?;
        let (handle, inbound, _) = channel.into_parts();

        let envelope = self.register_request()?;
        let mid = envelope.mid.clone();
        let reader = self.spawn_reply_reader(inbound, mid.clone());

        debug!(uid = %self.uid, %mid, "Requesting connection");
        let sent = serde_json::to_string(&envelope)
            .map_err(HandshakeError::from)
            .and_then(|data| Ok(handle.send(Frame::request_connection(data))?));
        if let Err(e) = sent {
            self.correlator.take(&mid);
            reader.abort();
            handle.disconnect();
            return Err(e);
        }

        let replied = self.correlator.wait(&mid, self.config.retry).await;
        let envelope = self.correlator.take(&mid);
        handle.disconnect();
        reader.abort();

        match envelope.and_then(|envelope| envelope.response) {
            Some(reply) if replied => {
                if !reply.is_verified() {
                    info!(uid = %self.uid, code = reply.code, "Connection request rejected");
                    return Err(HandshakeError::Rejected {
                        code: reply.code,
                        reason: reply.reason.unwrap_or(reply.response),
                    });
                }
                info!(uid = %self.uid, "Connection request verified");
                Ok(ConnectionResponse {
                    response: Some(reply.response),
                    timed_out: false,
                })
            }
            _ => {
                warn!(uid = %self.uid, %mid, "Connection request timed out");
                Ok(ConnectionResponse {
                    response: None,
                    timed_out: true,
                })
            }
        }
    }

    fn register_request(&self) -> Result<RequestEnvelope> {
        loop {
            let envelope = RequestEnvelope::new(self.uid.as_str(), self.token.as_str());
            match self.correlator.register(envelope.clone()) {
                Ok(()) => return Ok(envelope),
                Err(HandshakeError::DuplicateMid(mid)) => {
                    debug!(%mid, "Message id collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_reply_reader(&self, mut inbound: Inbound, mid: String) -> JoinHandle<()> {
        let correlator = Arc::clone(&self.correlator);
        let session_key = Arc::clone(&self.session_key);
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if frame.event != EVENT_MESSAGE {
                    continue;
                }
                let reply: Reply = match serde_json::from_str(&frame.data) {
                    Ok(reply) => reply,
                    Err(e) => {
                        debug!("Ignoring non-reply message: {}", e);
                        continue;
                    }
                };
                if reply.method != METHOD_REQUEST_CONNECTION {
                    debug!(method = %reply.method, "Ignoring reply for other method");
                    continue;
                }
                // The key is stored only if this reply resolves the request,
                // and before the waiter wakes so connect() sees it.
                let accepted = correlator.record_reply_with(&reply, |reply| {
                    if reply.is_verified()
                        && let Some(key) = &reply.key
                    {
                        *lock(&session_key) = Some(key.clone());
                    }
                });
                if !accepted {
                    debug!(mid = %reply.mid, "Reply arrived after the request resolved");
                }
            }
            correlator.cancel(&mid);
        })
    }

    /// Store a session key.
    pub fn authorize(&self, key: impl Into<String>) {
        *lock(&self.session_key) = Some(key.into());
    }

    pub fn is_authorized(&self) -> bool {
        lock(&self.session_key).is_some()
    }

    pub fn session_key(&self) -> Option<String> {
        lock(&self.session_key).clone()
    }

    /// Phase 2: open the data channel with the stored session key.
    ///
    /// Inbound frames are dispatched to callbacks registered with
    /// [`Initiator::register_event`]. A previous data channel is closed.
    pub async fn connect(&self) -> Result<ChannelHandle> {
        let key = self
            .session_key()
            .ok_or(HandshakeError::AuthorizationRequired)?;

        let request = ConnectRequest::new(self.config.url.as_str()).with_param(AUTH_PARAM, key);
        let channel = self.connector.connect(request).await?;
        let (handle, mut inbound, _) = channel.into_parts();

        let events = Arc::clone(&self.events);
        let uid = self.uid.clone();
        let channel_id = handle.id();
        let dispatcher = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let event = Event::new(frame.event)
                    .with_uid(uid.as_str())
                    .with_channel(channel_id)
                    .with_payload(frame.data);
                if !events.dispatch(&event) {
                    debug!(event = %event.name, "No handler for event");
                }
            }
            debug!(%uid, "Data channel closed");
        });

        let previous = lock(&self.channel).replace(DataChannel {
            handle: handle.clone(),
            dispatcher,
        });
        if let Some(previous) = previous {
            previous.handle.disconnect();
        }

        info!(uid = %self.uid, channel = %channel_id, "Connected");
        Ok(handle)
    }

    /// Send a `message` frame on the data channel.
    pub fn send(&self, data: impl Into<String>) -> Result<()> {
        let channel = lock(&self.channel);
        let channel = channel.as_ref().ok_or(HandshakeError::NotConnected)?;
        channel.handle.send(Frame::message(data))?;
        Ok(())
    }

    /// Send an arbitrary frame on the data channel.
    pub fn emit(&self, event: impl Into<String>, data: impl Into<String>) -> Result<()> {
        let channel = lock(&self.channel);
        let channel = channel.as_ref().ok_or(HandshakeError::NotConnected)?;
        channel.handle.send(Frame::new(event, data))?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.channel)
            .as_ref()
            .is_some_and(|channel| channel.handle.is_connected())
    }

    /// Close the data channel.
    pub fn close(&self) -> Result<()> {
        let channel = lock(&self.channel)
            .take()
            .ok_or(HandshakeError::NotConnected)?;
        channel.handle.disconnect();
        // Frames already queued are still dispatched before the task ends.
        drop(channel.dispatcher);
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.close()
    }

    pub fn kill(&self) -> Result<()> {
        self.close()
    }

    /// Observe inbound data-channel frames named `name`.
    pub fn register_event(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<()> {
        self.events.register(name, callback)
    }
}
