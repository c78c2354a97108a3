//! Event extension points.
//!
//! Two separate registries:
//! - [`SystemEvents`]: a closed set of server-side lifecycle events
//!   ([`SystemEvent`]). Observers are notified; they cannot change what the
//!   handshake does.
//! - [`EventRegistry`]: an open registry keyed by frame event name, fed by
//!   inbound data-channel frames. Names the handshake itself handles are
//!   reserved.
//!
//! Each name holds a single callback; registering again replaces it.

use crate::error::{HandshakeError, Result};
use crate::messages::EVENT_REQUEST_CONNECTION;
use crate::sync::{read, write};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Event names user callbacks may not claim.
pub const RESERVED_EVENTS: &[&str] = &[EVENT_REQUEST_CONNECTION];

/// What a callback is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub uid: Option<String>,
    pub channel_id: Option<Uuid>,
    pub payload: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            channel_id: None,
            payload: None,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_channel(mut self, channel_id: Uuid) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Server-side lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEvent {
    /// A transport connection was accepted.
    Connection,
    /// A phase-1 request was answered.
    RequestConnection,
    /// A phase-2 connection was promoted to open.
    Promoted,
    /// An open connection ended.
    Disconnect,
}

impl SystemEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::RequestConnection => EVENT_REQUEST_CONNECTION,
            Self::Promoted => "promoted",
            Self::Disconnect => "disconnect",
        }
    }

    pub fn event(&self) -> Event {
        Event::new(self.name())
    }
}

/// Observers of [`SystemEvent`]s.
#[derive(Default)]
pub struct SystemEvents {
    observers: RwLock<HashMap<SystemEvent, Callback>>,
}

impl SystemEvents {
    pub fn register(&self, event: SystemEvent, callback: impl Fn(&Event) + Send + Sync + 'static) {
        write(&self.observers).insert(event, Arc::new(callback));
    }

    pub fn emit(&self, kind: SystemEvent, event: &Event) {
        let observer = read(&self.observers).get(&kind).cloned();
        if let Some(observer) = observer {
            observer(event);
        }
    }
}

impl fmt::Debug for SystemEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observers: Vec<SystemEvent> = read(&self.observers).keys().copied().collect();
        f.debug_struct("SystemEvents")
            .field("observers", &observers)
            .finish()
    }
}

/// Callbacks for inbound frames, keyed by event name.
#[derive(Default)]
pub struct EventRegistry {
    callbacks: RwLock<HashMap<String, Callback>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        if RESERVED_EVENTS.contains(&name.as_str()) {
            return Err(HandshakeError::ReservedEvent(name));
        }
        write(&self.callbacks).insert(name, Arc::new(callback));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.callbacks).contains_key(name)
    }

    /// Invoke the callback for `event.name`. Returns whether one ran.
    pub fn dispatch(&self, event: &Event) -> bool {
        let callback = read(&self.callbacks).get(&event.name).cloned();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = read(&self.callbacks).keys().cloned().collect();
        f.debug_struct("EventRegistry").field("names", &names).finish()
    }
}
