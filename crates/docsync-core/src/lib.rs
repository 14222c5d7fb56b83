//! docsync Core Library
//!
//! Transport-agnostic synchronization of Automerge documents and presence.
//!
//! ## Overview
//!
//! A [`SyncProvider`] sits between a local document that the application
//! edits directly and a transport that moves opaque bytes between replicas.
//! Local edits and presence changes become wire messages; inbound messages
//! become document and presence changes. The provider tracks whether a
//! session is up and whether a handshake with a peer has completed.
//!
//! ## Core Principles
//!
//! - **Transport-agnostic**: the provider emits bytes and accepts bytes
//! - **Convergent**: deltas may be applied twice or out of order
//! - **Self-healing**: an optional resync interval re-runs the handshake
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use docsync_core::{AutomergeDoc, MemoryTransport, ProviderConfig, RoomRegistry, SyncProvider};
//!
//! let registry = RoomRegistry::new();
//!
//! let doc_a = Arc::new(AutomergeDoc::new());
//! let a = SyncProvider::new(doc_a.clone(), ProviderConfig::default())?;
//! let _ta = MemoryTransport::connect(&registry, "notes", a.clone());
//!
//! let doc_b = Arc::new(AutomergeDoc::new());
//! let b = SyncProvider::new(doc_b.clone(), ProviderConfig::default())?;
//! let _tb = MemoryTransport::connect(&registry, "notes", b.clone());
//!
//! doc_a.put("title", "Shopping")?;
//! assert_eq!(doc_b.get("title")?, Some(serde_json::json!("Shopping")));
//! ```

pub mod doc;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod presence;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use doc::{AutomergeDoc, DocUpdate, Document};
pub use error::{SyncError, SyncResult};
pub use lifecycle::ExitHooks;
pub use presence::{Awareness, Presence, PresenceChange};
pub use sync::{
    ConnectionStatus, EventBus, Message, MessageKind, OutboundMessage, ProviderConfig,
    ProviderEvent, SyncMessage, SyncProvider, Topic,
};
pub use transport::{ChannelTransport, MemoryTransport, RoomRegistry, WireFrame};
pub use types::*;
