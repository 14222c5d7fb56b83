//! Core types for docsync

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one document replica
///
/// Assigned by the document adapter and stable for the lifetime of a
/// provider. Travels next to every outbound message so bindings can tell
/// who sent it without parsing the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Create a new random ReplicaId in the 32-bit range
    pub fn random() -> Self {
        Self(u64::from(rand::random::<u32>()))
    }

    /// Get the raw integer value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identity of one provider instance
///
/// Two providers may wrap the same document; this is what tells their
/// applied updates apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(u64);

impl ProviderId {
    /// Allocate the next provider id
    pub fn next() -> Self {
        Self(NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider_{}", self.0)
    }
}

/// Who caused a document or presence change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The application edited its own replica
    Local,
    /// A provider applied a change it received from a peer
    Provider(ProviderId),
    /// A lifecycle event, e.g. `"process exit"`
    Named(&'static str),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Provider(id) => write!(f, "{}", id),
            Origin::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Handle returned by every `subscribe`/`on` call, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared callback type
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of listeners for one kind of notification.
///
/// `notify` snapshots the list before calling out, so listeners may
/// subscribe, unsubscribe or trigger further notifications re-entrantly.
pub struct Listeners<T> {
    entries: Mutex<Vec<(SubscriptionId, Listener<T>)>>,
}

impl<T> Listeners<T> {
    /// Create an empty listener list
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Append a listener; it runs after all previously added ones
    pub fn add(&self, listener: Listener<T>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.entries.lock().push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Remove every listener
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Call every listener in registration order
    pub fn notify(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}
