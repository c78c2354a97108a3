//! Transport seam.
//!
//! The handshake only needs a reliable, ordered, message-oriented channel per
//! connection. A [`Connector`] opens channels (client side), an [`Acceptor`]
//! yields them (server side). Adapters for concrete transports bridge their
//! socket to one end of a [`pair`] and hand the other end to the handshake.
//!
//! # Lifecycle
//!
//! ```text
//! Server:                      Client:
//! Acceptor::accept()           Connector::connect(request)
//!   ↓                            ↓
//! [Channel]  <── frames ──>    [Channel]
//!   ↓                            ↓
//! ChannelHandle::disconnect()  (peer sees the channel end)
//! ```
//!
//! Frames sent before a disconnect are still delivered to the peer.

use crate::sync::lock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::messages::{EVENT_MESSAGE, EVENT_REQUEST_CONNECTION};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Nothing listening at {0}")]
    Unreachable(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// One message on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    pub fn message(data: impl Into<String>) -> Self {
        Self::new(EVENT_MESSAGE, data)
    }

    pub fn request_connection(data: impl Into<String>) -> Self {
        Self::new(EVENT_REQUEST_CONNECTION, data)
    }

    /// Encode as a single text message for stream transports.
    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::InvalidFrame(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::InvalidFrame(e.to_string()))
    }
}

/// Connection-establishment metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub channel_id: Uuid,
    pub peer_addr: Option<SocketAddr>,
    /// Parameters passed when the connection was opened.
    pub query: BTreeMap<String, String>,
    pub connected_at: DateTime<Utc>,
}

impl HandshakeInfo {
    pub fn new(peer_addr: Option<SocketAddr>, query: BTreeMap<String, String>) -> Self {
        Self {
            channel_id: Uuid::now_v7(),
            peer_addr,
            query,
            connected_at: Utc::now(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Sending half of a channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelHandle {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<watch::Sender<bool>>,
}

impl ChannelHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    pub fn send_message(&self, data: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::message(data))
    }

    /// Close the channel for both ends.
    pub fn disconnect(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_connected(&self) -> bool {
        !*self.closed.borrow() && !self.outbound.is_closed()
    }

    /// Resolves once the channel is disconnected.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Receiving half of a channel.
#[derive(Debug)]
pub struct Inbound {
    frames: mpsc::UnboundedReceiver<Frame>,
    closed: watch::Receiver<bool>,
}

impl Inbound {
    /// Next frame, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.frames.recv() => frame,
            _ = self.closed.wait_for(|closed| *closed) => self.frames.try_recv().ok(),
        }
    }
}

/// An established channel.
#[derive(Debug)]
pub struct Channel {
    handle: ChannelHandle,
    inbound: Inbound,
    info: HandshakeInfo,
}

impl Channel {
    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub fn info(&self) -> &HandshakeInfo {
        &self.info
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    pub fn into_parts(self) -> (ChannelHandle, Inbound, HandshakeInfo) {
        (self.handle, self.inbound, self.info)
    }
}

/// Build two linked channel ends sharing one close state.
pub fn pair(info: HandshakeInfo) -> (Channel, Channel) {
    let (closed, _) = watch::channel(false);
    let closed = Arc::new(closed);
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let end = |outbound, frames| Channel {
        handle: ChannelHandle {
            id: info.channel_id,
            outbound,
            closed: Arc::clone(&closed),
        },
        inbound: Inbound {
            frames,
            closed: closed.subscribe(),
        },
        info: info.clone(),
    };

    (end(a_tx, b_rx), end(b_tx, a_rx))
}

/// Parameters for opening a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub query: BTreeMap<String, String>,
}

impl ConnectRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// The url with parameters appended as a query string.
    ///
    /// Values are appended verbatim; session keys are base64url and need no
    /// escaping.
    pub fn to_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let params: Vec<String> = self
            .query
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, params.join("&"))
    }
}

/// Client side of a transport.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, request: ConnectRequest) -> Result<Channel, TransportError>;
}

/// Server side of a transport.
#[async_trait]
pub trait Acceptor: Send + 'static {
    /// Next accepted connection, or `None` once the listener is gone.
    async fn accept(&mut self) -> Option<Channel>;
}

/// In-process transport.
///
/// Listeners are keyed by url. Connecting to a url nobody listens on fails
/// with [`TransportError::Unreachable`].
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Channel>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `url`, replacing any previous listener.
    pub fn listen(&self, url: impl Into<String>) -> MemoryListener {
        let url = url.into();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.listeners).insert(url.clone(), tx);
        MemoryListener { url, incoming: rx }
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, request: ConnectRequest) -> Result<Channel, TransportError> {
        let listener = lock(&self.listeners)
            .get(&request.url)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(request.url.clone()))?;

        let (client, server) = pair(HandshakeInfo::new(None, request.query));
        listener
            .send(server)
            .map_err(|_| TransportError::Unreachable(request.url))?;
        Ok(client)
    }
}

pub struct MemoryListener {
    url: String,
    incoming: mpsc::UnboundedReceiver<Channel>,
}

impl MemoryListener {
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Acceptor for MemoryListener {
    async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }
}
