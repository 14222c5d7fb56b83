//! Provider events and the publish/subscribe registry that carries them
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConnectionStatus: Per-provider connection state                │
//! │  ├── Idle: Never announced                                      │
//! │  ├── Connecting: Transport is establishing a session            │
//! │  ├── Connected: Transport is up, handshake started              │
//! │  └── Disconnected: Transport went away                          │
//! │                                                                 │
//! │  ProviderEvent: One per topic                                   │
//! │  ├── Broadcast: Outbound bytes a transport must ship            │
//! │  ├── Status: ConnectionStatus changed                           │
//! │  └── Synced / Sync: Sync flag changed (same payload, two names) │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::protocol::MessageKind;
use crate::types::{Listeners, ReplicaId, SubscriptionId};

/// Connection status of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No lifecycle announcement yet
    #[default]
    Idle,
    /// Establishing a session
    Connecting,
    /// Session established
    Connected,
    /// Session lost or closed
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Idle => write!(f, "idle"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Bytes a transport must deliver to every peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Kind of the encoded message
    pub kind: MessageKind,
    /// The full encoded message, tag included
    pub payload: Bytes,
    /// Replica that produced it
    pub origin: ReplicaId,
}

/// Event topics a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Broadcast,
    Status,
    Synced,
    Sync,
}

/// Events emitted by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// An outbound message for the transport
    Broadcast(OutboundMessage),
    /// The connection status changed
    Status(ConnectionStatus),
    /// The sync flag changed
    Synced(bool),
    /// The sync flag changed (alias of `Synced` for other listener conventions)
    Sync(bool),
}

impl ProviderEvent {
    /// Topic this event is published on
    pub fn topic(&self) -> Topic {
        match self {
            ProviderEvent::Broadcast(_) => Topic::Broadcast,
            ProviderEvent::Status(_) => Topic::Status,
            ProviderEvent::Synced(_) => Topic::Synced,
            ProviderEvent::Sync(_) => Topic::Sync,
        }
    }
}

/// Topic → ordered listener list
///
/// Transports depend only on this registry, never on the provider type.
#[derive(Default)]
pub struct EventBus {
    broadcast: Listeners<ProviderEvent>,
    status: Listeners<ProviderEvent>,
    synced: Listeners<ProviderEvent>,
    sync: Listeners<ProviderEvent>,
}

impl EventBus {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self, topic: Topic) -> &Listeners<ProviderEvent> {
        match topic {
            Topic::Broadcast => &self.broadcast,
            Topic::Status => &self.status,
            Topic::Synced => &self.synced,
            Topic::Sync => &self.sync,
        }
    }

    /// Subscribe to a topic
    pub fn on<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        self.listeners(topic).add(Arc::new(listener))
    }

    /// Subscribe to outbound messages only
    pub fn on_broadcast<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&OutboundMessage) + Send + Sync + 'static,
    {
        self.on(Topic::Broadcast, move |event| {
            if let ProviderEvent::Broadcast(message) = event {
                listener(message);
            }
        })
    }

    /// Unsubscribe. Returns `false` if `id` was not subscribed to `topic`.
    pub fn off(&self, topic: Topic, id: SubscriptionId) -> bool {
        self.listeners(topic).remove(id)
    }

    /// Deliver an event to its topic's listeners in subscription order
    pub fn emit(&self, event: &ProviderEvent) {
        self.listeners(event.topic()).notify(event);
    }

    /// Number of listeners on a topic
    pub fn listener_count(&self, topic: Topic) -> usize {
        self.listeners(topic).len()
    }
}
