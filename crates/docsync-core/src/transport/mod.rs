//! Transport bindings
//!
//! A binding satisfies a small contract against a [`SyncProvider`]:
//!
//! 1. Subscribe to the provider's broadcast events and ship every
//!    [`OutboundMessage`] payload, with its origin, to the other replicas.
//! 2. Feed every inbound payload to [`SyncProvider::on_message`] with the
//!    sender's replica id. Own messages may be fed back; they are ignored.
//! 3. Call `announce_connecting`, `announce_connected` and
//!    `announce_disconnected` as the session comes and goes.
//!
//! [`SyncProvider`]: crate::sync::SyncProvider
//! [`SyncProvider::on_message`]: crate::sync::SyncProvider::on_message
//! [`OutboundMessage`]: crate::sync::OutboundMessage

pub mod channel;
pub mod memory;

pub use channel::{ChannelTransport, WireFrame, DEFAULT_CHANNEL_CAPACITY};
pub use memory::{MemoryTransport, Room, RoomMessage, RoomRegistry};
