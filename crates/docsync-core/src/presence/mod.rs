//! Presence adapter contract
//!
//! Presence (awareness) is ephemeral per-replica state such as a cursor or a
//! user name. It is never persisted and is synchronized separately from the
//! document.

mod awareness;

pub use awareness::{Awareness, AwarenessEntry, AwarenessUpdate};

use serde_json::Value;

use crate::error::SyncResult;
use crate::types::{Listener, Origin, ReplicaId, SubscriptionId};

/// Notification emitted after presence entries changed
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceChange {
    pub added: Vec<ReplicaId>,
    pub updated: Vec<ReplicaId>,
    pub removed: Vec<ReplicaId>,
    pub origin: Origin,
}

impl PresenceChange {
    /// Every replica touched by this change, in added/updated/removed order
    pub fn changed(&self) -> Vec<ReplicaId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// A presence table the provider can synchronize
pub trait Presence: Send + Sync {
    /// Replica that owns the local entry
    fn replica_id(&self) -> ReplicaId;

    /// The local entry, `None` once it has been removed
    fn local_state(&self) -> Option<Value>;

    /// Every replica with a live entry, local included
    fn replica_ids(&self) -> Vec<ReplicaId>;

    /// Encode the current entries of `replicas` (absent ones as removals)
    fn encode_update(&self, replicas: &[ReplicaId]) -> SyncResult<Vec<u8>>;

    /// Merge an encoded update from a peer. Listeners see `origin`.
    fn apply_update(&self, update: &[u8], origin: Origin) -> SyncResult<()>;

    /// Drop the entries of `replicas`
    fn remove_states(&self, replicas: &[ReplicaId], origin: Origin);

    /// Register an update listener
    fn subscribe(&self, listener: Listener<PresenceChange>) -> SubscriptionId;

    /// Remove an update listener. Returns `false` if it was not registered.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}
