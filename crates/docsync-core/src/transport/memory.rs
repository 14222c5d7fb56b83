//! Synchronous in-process transport
//!
//! Providers join a named [`Room`]; everything one member broadcasts is
//! delivered to every member before `publish` returns, the sender included.
//!
//! A joining member's Step1 is answered inside its `connect`, so it is
//! synced on return. Members already in the room only receive that Step1;
//! they become synced once they send one of their own, through
//! [`SyncProvider::resync`] or a resync interval.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::sync::{SyncProvider, Topic};
use crate::types::{Listeners, ReplicaId, SubscriptionId};

/// A message relayed through a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub origin: ReplicaId,
    pub message: Bytes,
}

/// Named broadcast group
pub struct Room {
    name: String,
    members: Listeners<RoomMessage>,
}

impl Room {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Listeners::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver to every member in join order
    pub fn publish(&self, message: &RoomMessage) {
        self.members.notify(message);
    }

    pub fn subscribe<F>(&self, member: F) -> SubscriptionId
    where
        F: Fn(&RoomMessage) + Send + Sync + 'static,
    {
        self.members.add(Arc::new(member))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.members.remove(id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Registry of rooms, created on first use
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the room called `name`
    pub fn room(&self, name: &str) -> Arc<Room> {
        self.rooms
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Room::new(name)))
            .clone()
    }

    /// Forget every room. Connected transports keep their room alive.
    pub fn reset(&self) {
        self.rooms.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.lock().is_empty()
    }
}

/// Binds one provider to a [`Room`]
///
/// Dropping the transport disconnects it.
pub struct MemoryTransport {
    room: Arc<Room>,
    provider: Arc<SyncProvider>,
    subscriptions: Mutex<Option<(SubscriptionId, SubscriptionId)>>,
}

impl MemoryTransport {
    /// Join `room` and run the connect handshake
    pub fn connect(registry: &RoomRegistry, room: &str, provider: Arc<SyncProvider>) -> Self {
        let room = registry.room(room);
        debug!(replica = %provider.id(), room = %room.name(), "Joining room");

        provider.announce_connecting();

        let inbound = {
            let provider_ref: Weak<SyncProvider> = Arc::downgrade(&provider);
            room.subscribe(move |message: &RoomMessage| {
                let Some(provider) = provider_ref.upgrade() else {
                    return;
                };
                if let Err(e) = provider.on_message(&message.message, message.origin) {
                    warn!(
                        replica = %provider.id(),
                        origin = %message.origin,
                        error = %e,
                        "Dropping malformed message"
                    );
                }
            })
        };

        let outbound = {
            let room = room.clone();
            provider.events().on_broadcast(move |message| {
                room.publish(&RoomMessage {
                    origin: message.origin,
                    message: message.payload.clone(),
                });
            })
        };

        provider.announce_connected();

        Self {
            room,
            provider,
            subscriptions: Mutex::new(Some((inbound, outbound))),
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn provider(&self) -> &Arc<SyncProvider> {
        &self.provider
    }

    pub fn is_connected(&self) -> bool {
        self.subscriptions.lock().is_some()
    }

    /// Leave the room. Calling it again does nothing.
    pub fn disconnect(&self) {
        let Some((inbound, outbound)) = self.subscriptions.lock().take() else {
            return;
        };

        debug!(replica = %self.provider.id(), room = %self.room.name(), "Leaving room");
        self.room.unsubscribe(inbound);
        self.provider.events().off(Topic::Broadcast, outbound);
        self.provider.announce_disconnected();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
