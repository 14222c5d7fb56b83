//! Document adapter contract
//!
//! The provider never looks inside a document. It only needs to ask for a
//! state vector, compute a delta against a peer's state vector, apply a
//! delta, and hear about every update together with who caused it.

mod automerge_doc;

pub use automerge_doc::AutomergeDoc;

use crate::error::SyncResult;
use crate::types::{Listener, Origin, ReplicaId, SubscriptionId};

/// Notification emitted after a document changed
#[derive(Debug, Clone)]
pub struct DocUpdate {
    /// Binary delta describing the change
    pub update: Vec<u8>,
    /// Who caused it
    pub origin: Origin,
}

/// A replicated document the provider can synchronize
pub trait Document: Send + Sync {
    /// Stable identity of this replica
    fn replica_id(&self) -> ReplicaId;

    /// Compact description of what this replica has seen
    fn state_vector(&self) -> SyncResult<Vec<u8>>;

    /// Delta containing everything a peer with `state_vector` is missing
    fn encode_state_as_update(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>>;

    /// Apply a delta produced by a peer. Listeners see `origin`.
    fn apply_update(&self, update: &[u8], origin: Origin) -> SyncResult<()>;

    /// Register an update listener
    fn subscribe(&self, listener: Listener<DocUpdate>) -> SubscriptionId;

    /// Remove an update listener. Returns `false` if it was not registered.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}
