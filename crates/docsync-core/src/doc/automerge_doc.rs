//! Automerge-backed document adapter
//!
//! AutomergeDoc wraps an Automerge document behind a mutex and reports every
//! change to its listeners. The state vector is the list of document heads;
//! a delta is `save_after(heads)` and is applied with `load_incremental`.

use automerge::transaction::Transactable;
use automerge::{
    ActorId, AutoCommit, AutomergeError, ChangeHash, ObjId, ObjType, ReadDoc, ScalarValue, ROOT,
};
use parking_lot::Mutex;
use serde_json::Value;

use super::{DocUpdate, Document};
use crate::error::{SyncError, SyncResult};
use crate::types::{Listener, Listeners, Origin, ReplicaId, SubscriptionId};

/// Automerge document shared between the application and a provider
///
/// # Example
///
/// ```
/// use docsync_core::doc::AutomergeDoc;
/// use docsync_core::ReplicaId;
///
/// let doc = AutomergeDoc::with_replica_id(ReplicaId(1));
/// doc.put("counter", 3i64).unwrap();
/// assert_eq!(doc.get("counter").unwrap(), Some(serde_json::json!(3)));
/// ```
pub struct AutomergeDoc {
    replica_id: ReplicaId,
    doc: Mutex<AutoCommit>,
    listeners: Listeners<DocUpdate>,
}

impl AutomergeDoc {
    /// Create an empty document with a random replica id
    pub fn new() -> Self {
        Self::with_replica_id(ReplicaId::random())
    }

    /// Create an empty document with a fixed replica id
    ///
    /// The id's big-endian bytes become the Automerge actor id, so two
    /// replicas must never share one.
    pub fn with_replica_id(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            doc: Mutex::new(AutoCommit::new().with_actor(actor_for(replica_id))),
            listeners: Listeners::new(),
        }
    }

    /// Load a document from saved bytes
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Automerge` if the bytes are not a valid Automerge document.
    pub fn load(replica_id: ReplicaId, data: &[u8]) -> SyncResult<Self> {
        let doc = AutoCommit::load(data).map_err(automerge_err)?;
        Ok(Self {
            replica_id,
            doc: Mutex::new(doc.with_actor(actor_for(replica_id))),
            listeners: Listeners::new(),
        })
    }

    /// Save the full document to bytes
    pub fn save(&self) -> Vec<u8> {
        self.doc.lock().save()
    }

    /// Current document heads
    pub fn heads(&self) -> Vec<ChangeHash> {
        self.doc.lock().get_heads()
    }

    /// Run a local edit and notify listeners with the resulting delta
    ///
    /// The closure's changes are rolled back if it fails. Listeners run after
    /// the document lock is released and only if the heads moved.
    pub fn transact<F, R>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&mut AutoCommit) -> Result<R, AutomergeError>,
    {
        let (result, update) = {
            let mut doc = self.doc.lock();
            let before = doc.get_heads();

            let result = match f(&mut *doc) {
                Ok(result) => result,
                Err(e) => {
                    doc.rollback();
                    return Err(automerge_err(e));
                }
            };

            let update = if doc.get_heads() != before {
                Some(doc.save_after(&before))
            } else {
                None
            };
            (result, update)
        };

        if let Some(update) = update {
            self.listeners.notify(&DocUpdate {
                update,
                origin: Origin::Local,
            });
        }

        Ok(result)
    }

    /// Set a scalar at the root map
    pub fn put(&self, key: &str, value: impl Into<ScalarValue>) -> SyncResult<()> {
        let value = value.into();
        self.transact(|doc| doc.put(ROOT, key, value))
    }

    /// Delete a key from the root map
    pub fn delete(&self, key: &str) -> SyncResult<()> {
        self.transact(|doc| doc.delete(ROOT, key))
    }

    /// Read a root-level value as JSON
    pub fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        let doc = self.doc.lock();
        match doc.get(ROOT, key).map_err(automerge_err)? {
            Some((value, id)) => Ok(Some(value_to_json(&doc, value, &id)?)),
            None => Ok(None),
        }
    }

    /// Render the whole document as JSON
    pub fn to_json(&self) -> SyncResult<Value> {
        let doc = self.doc.lock();
        object_to_json(&doc, &ROOT)
    }
}

impl Default for AutomergeDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl Document for AutomergeDoc {
    fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn state_vector(&self) -> SyncResult<Vec<u8>> {
        let heads: Vec<[u8; 32]> = self.heads().into_iter().map(|h| h.0).collect();
        postcard::to_allocvec(&heads).map_err(|e| SyncError::Encode(e.to_string()))
    }

    fn encode_state_as_update(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        let their_heads: Vec<[u8; 32]> =
            postcard::from_bytes(state_vector).map_err(|e| SyncError::Decode(e.to_string()))?;

        let mut doc = self.doc.lock();

        // Heads we have never seen mean the peer is ahead there; diff against
        // the ones we know and let duplicates be ignored on their side.
        let known: Vec<ChangeHash> = their_heads
            .into_iter()
            .map(ChangeHash)
            .filter(|hash| doc.get_change_by_hash(hash).is_some())
            .collect();

        Ok(doc.save_after(&known))
    }

    fn apply_update(&self, update: &[u8], origin: Origin) -> SyncResult<()> {
        if update.is_empty() {
            return Ok(());
        }

        let changed = {
            let mut doc = self.doc.lock();
            let before = doc.get_heads();
            doc.load_incremental(update).map_err(automerge_err)?;
            doc.get_heads() != before
        };

        if changed {
            self.listeners.notify(&DocUpdate {
                update: update.to_vec(),
                origin,
            });
        }

        Ok(())
    }

    fn subscribe(&self, listener: Listener<DocUpdate>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }
}

fn actor_for(replica_id: ReplicaId) -> ActorId {
    ActorId::from(&replica_id.0.to_be_bytes()[..])
}

fn automerge_err(e: AutomergeError) -> SyncError {
    SyncError::Automerge(e.to_string())
}

fn object_to_json(doc: &AutoCommit, obj: &ObjId) -> SyncResult<Value> {
    match doc.object_type(obj).map_err(automerge_err)? {
        ObjType::Map | ObjType::Table => {
            let mut map = serde_json::Map::new();
            for key in doc.keys(obj) {
                if let Some((value, id)) = doc.get(obj, key.as_str()).map_err(automerge_err)? {
                    let json = value_to_json(doc, value, &id)?;
                    map.insert(key, json);
                }
            }
            Ok(Value::Object(map))
        }
        ObjType::List => {
            let mut items = Vec::new();
            for index in 0..doc.length(obj) {
                if let Some((value, id)) = doc.get(obj, index).map_err(automerge_err)? {
                    items.push(value_to_json(doc, value, &id)?);
                }
            }
            Ok(Value::Array(items))
        }
        ObjType::Text => Ok(Value::String(doc.text(obj).map_err(automerge_err)?)),
    }
}

fn value_to_json(doc: &AutoCommit, value: automerge::Value<'_>, id: &ObjId) -> SyncResult<Value> {
    match value {
        automerge::Value::Object(_) => object_to_json(doc, id),
        automerge::Value::Scalar(scalar) => Ok(scalar_to_json(&scalar)),
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> Value {
    match scalar {
        ScalarValue::Null => Value::Null,
        ScalarValue::Boolean(b) => Value::Bool(*b),
        ScalarValue::Int(i) => Value::from(*i),
        ScalarValue::Uint(u) => Value::from(*u),
        ScalarValue::F64(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ScalarValue::Str(s) => Value::String(s.to_string()),
        other => Value::String(other.to_string()),
    }
}
