//! Synchronization layer
//!
//! ## Overview
//!
//! A [`SyncProvider`] wraps one document replica and its presence table. It
//! never touches the network: outbound bytes are published on its
//! [`EventBus`] and a transport binding feeds inbound bytes back through
//! [`SyncProvider::on_message`].
//!
//! ```text
//!   transport ──bytes──▶ on_message ──▶ Document / Presence
//!       ▲                                      │
//!       └──── Broadcast event ◀── listeners ◀──┘
//! ```
//!
//! ## Protocol
//!
//! Four message kinds, see [`protocol`]:
//!
//! - **DocumentSync**: Step1 / Step2 handshake and incremental updates
//! - **PresenceQuery**: Ask for every known presence entry
//! - **PresenceUpdate**: Presence entries that changed
//! - **Authorization**: Permission denied notice

pub mod events;
pub mod protocol;
pub mod provider;

pub use events::{ConnectionStatus, EventBus, OutboundMessage, ProviderEvent, Topic};
pub use protocol::{read_sync_message, AuthMessage, Message, MessageKind, SyncMessage, SyncStep};
pub use provider::{ProviderConfig, SyncProvider, EXIT_ORIGIN};
