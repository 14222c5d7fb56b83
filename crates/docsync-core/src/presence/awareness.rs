//! In-memory presence table
//!
//! Every entry carries a logical clock owned by the replica it describes.
//! An incoming entry wins only if its clock is newer, or if it is an equal
//! clock removal of an entry we still hold. Removed entries keep their clock
//! so the removal itself can be propagated.
//!
//! ```text
//! AwarenessUpdate = varuint(count) • Entry*
//! Entry           = varuint(replica) • varuint(clock) • varstring(json)
//! ```
//!
//! A JSON `null` state marks a removed entry.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Presence, PresenceChange};
use crate::error::{SyncError, SyncResult};
use crate::types::{Listener, Listeners, Origin, ReplicaId, SubscriptionId};

/// One entry of an encoded presence update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub replica: ReplicaId,
    pub clock: u64,
    /// JSON-encoded state, `"null"` for a removal
    pub state: String,
}

/// Encoded presence update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    /// Encode update to bytes using postcard
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Encode(e.to_string()))
    }

    /// Decode update from bytes using postcard
    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(data).map_err(|e| SyncError::Decode(e.to_string()))
    }
}

#[derive(Default)]
struct AwarenessState {
    states: BTreeMap<ReplicaId, Value>,
    /// Last clock seen per replica, removed entries included
    clocks: HashMap<ReplicaId, u64>,
}

/// Presence table for one replica and everything it has heard about
pub struct Awareness {
    replica_id: ReplicaId,
    inner: Mutex<AwarenessState>,
    listeners: Listeners<PresenceChange>,
}

impl Awareness {
    /// Create a table whose local entry starts as an empty JSON object
    pub fn new(replica_id: ReplicaId) -> Self {
        let mut inner = AwarenessState::default();
        inner.states.insert(replica_id, Value::Object(Default::default()));
        inner.clocks.insert(replica_id, 0);

        Self {
            replica_id,
            inner: Mutex::new(inner),
            listeners: Listeners::new(),
        }
    }

    /// Replace the local entry; `None` removes it
    pub fn set_local_state(&self, state: Option<Value>) {
        let change = {
            let mut inner = self.inner.lock();
            let clock = inner
                .clocks
                .get(&self.replica_id)
                .map(|c| c + 1)
                .unwrap_or(0);

            let previous = match &state {
                Some(value) => inner.states.insert(self.replica_id, value.clone()),
                None => inner.states.remove(&self.replica_id),
            };
            inner.clocks.insert(self.replica_id, clock);

            let mut change = empty_change(Origin::Local);
            match (previous, state) {
                (_, None) => change.removed.push(self.replica_id),
                (None, Some(_)) => change.added.push(self.replica_id),
                (Some(_), Some(_)) => change.updated.push(self.replica_id),
            }
            change
        };

        self.listeners.notify(&change);
    }

    /// Set one field of the local entry, creating the entry if needed
    pub fn set_local_state_field(&self, field: &str, value: Value) {
        let mut state = match self.local_state() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        state.insert(field.to_string(), value);
        self.set_local_state(Some(Value::Object(state)));
    }

    /// State of any replica
    pub fn state(&self, replica: ReplicaId) -> Option<Value> {
        self.inner.lock().states.get(&replica).cloned()
    }

    /// Snapshot of every live entry
    pub fn states(&self) -> BTreeMap<ReplicaId, Value> {
        self.inner.lock().states.clone()
    }

    /// Clock of the last entry seen for `replica`, removed entries included
    pub fn clock(&self, replica: ReplicaId) -> Option<u64> {
        self.inner.lock().clocks.get(&replica).copied()
    }
}

impl Presence for Awareness {
    fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn local_state(&self) -> Option<Value> {
        self.state(self.replica_id)
    }

    fn replica_ids(&self) -> Vec<ReplicaId> {
        self.inner.lock().states.keys().copied().collect()
    }

    fn encode_update(&self, replicas: &[ReplicaId]) -> SyncResult<Vec<u8>> {
        let entries = {
            let inner = self.inner.lock();
            replicas
                .iter()
                .map(|replica| {
                    let state = inner.states.get(replica).unwrap_or(&Value::Null);
                    let clock = inner.clocks.get(replica).copied().unwrap_or(0);
                    serde_json::to_string(state)
                        .map(|state| AwarenessEntry {
                            replica: *replica,
                            clock,
                            state,
                        })
                        .map_err(|e| SyncError::Encode(e.to_string()))
                })
                .collect::<SyncResult<Vec<_>>>()?
        };

        AwarenessUpdate { entries }.encode()
    }

    fn apply_update(&self, update: &[u8], origin: Origin) -> SyncResult<()> {
        let decoded = AwarenessUpdate::decode(update)?;

        // Parse everything before touching the table so a bad entry leaves it untouched
        let mut parsed = Vec::with_capacity(decoded.entries.len());
        for entry in decoded.entries {
            let state: Value = serde_json::from_str(&entry.state)
                .map_err(|e| SyncError::Presence(format!("replica {}: {}", entry.replica, e)))?;
            parsed.push((entry.replica, entry.clock, state));
        }

        let change = {
            let mut inner = self.inner.lock();
            let mut change = empty_change(origin);

            for (replica, mut clock, state) in parsed {
                let known = inner.clocks.get(&replica).copied();
                let current_clock = known.unwrap_or(0);
                let is_removal = state.is_null();

                let newer = current_clock < clock;
                let equal_clock_removal =
                    current_clock == clock && is_removal && inner.states.contains_key(&replica);
                if !(newer || equal_clock_removal) {
                    continue;
                }

                if is_removal {
                    if replica == self.replica_id && inner.states.contains_key(&replica) {
                        // A peer dropped us while we are still here: outbid its clock
                        clock += 1;
                        inner.clocks.insert(replica, clock);
                        change.updated.push(replica);
                        continue;
                    }
                    inner.states.remove(&replica);
                } else {
                    inner.states.insert(replica, state.clone());
                }
                inner.clocks.insert(replica, clock);

                match (known, is_removal) {
                    (None, false) => change.added.push(replica),
                    (Some(_), true) => change.removed.push(replica),
                    (Some(_), false) => change.updated.push(replica),
                    (None, true) => {}
                }
            }
            change
        };

        if !change.is_empty() {
            debug!(
                replica = %self.replica_id,
                added = change.added.len(),
                updated = change.updated.len(),
                removed = change.removed.len(),
                "Applied presence update"
            );
            self.listeners.notify(&change);
        }

        Ok(())
    }

    fn remove_states(&self, replicas: &[ReplicaId], origin: Origin) {
        let change = {
            let mut inner = self.inner.lock();
            let mut change = empty_change(origin);

            for replica in replicas {
                if inner.states.remove(replica).is_none() {
                    continue;
                }
                if *replica == self.replica_id {
                    let clock = inner.clocks.get(replica).map(|c| c + 1).unwrap_or(0);
                    inner.clocks.insert(*replica, clock);
                }
                change.removed.push(*replica);
            }
            change
        };

        if !change.is_empty() {
            self.listeners.notify(&change);
        }
    }

    fn subscribe(&self, listener: Listener<PresenceChange>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }
}

fn empty_change(origin: Origin) -> PresenceChange {
    PresenceChange {
        added: Vec::new(),
        updated: Vec::new(),
        removed: Vec::new(),
        origin,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn recorder(awareness: &Awareness) -> Arc<Mutex<Vec<PresenceChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        awareness.subscribe(Arc::new(move |change: &PresenceChange| {
            sink.lock().push(change.clone())
        }));
        seen
    }

    fn sync_all(from: &Awareness, to: &Awareness) {
        let update = from.encode_update(&from.replica_ids()).unwrap();
        to.apply_update(&update, Origin::Named("test")).unwrap();
    }

    #[test]
    fn test_new_has_empty_local_state() {
        let awareness = Awareness::new(ReplicaId(1));
        assert_eq!(awareness.local_state(), Some(json!({})));
        assert_eq!(awareness.replica_ids(), vec![ReplicaId(1)]);
        assert_eq!(awareness.clock(ReplicaId(1)), Some(0));
    }

    #[test]
    fn test_set_local_state_bumps_clock() {
        let awareness = Awareness::new(ReplicaId(1));
        let seen = recorder(&awareness);

        awareness.set_local_state_field("cursor", json!(4));

        assert_eq!(awareness.local_state(), Some(json!({"cursor": 4})));
        assert_eq!(awareness.clock(ReplicaId(1)), Some(1));
        let seen = seen.lock();
        assert_eq!(seen[0].updated, vec![ReplicaId(1)]);
        assert_eq!(seen[0].origin, Origin::Local);
    }

    #[test]
    fn test_apply_adds_remote_entry() {
        let a = Awareness::new(ReplicaId(1));
        let b = Awareness::new(ReplicaId(2));
        a.set_local_state(Some(json!({"name": "a"})));
        let seen = recorder(&b);

        sync_all(&a, &b);

        assert_eq!(b.state(ReplicaId(1)), Some(json!({"name": "a"})));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].added, vec![ReplicaId(1)]);
        assert_eq!(seen[0].origin, Origin::Named("test"));
    }

    #[test]
    fn test_stale_entry_is_ignored() {
        let a = Awareness::new(ReplicaId(1));
        let b = Awareness::new(ReplicaId(2));
        a.set_local_state(Some(json!({"v": 1})));
        let stale = a.encode_update(&[ReplicaId(1)]).unwrap();
        a.set_local_state(Some(json!({"v": 2})));
        sync_all(&a, &b);

        let seen = recorder(&b);
        b.apply_update(&stale, Origin::Local).unwrap();

        assert_eq!(b.state(ReplicaId(1)), Some(json!({"v": 2})));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_same_clock_echo_is_silent() {
        let a = Awareness::new(ReplicaId(1));
        let b = Awareness::new(ReplicaId(2));
        sync_all(&a, &b);

        let seen = recorder(&b);
        sync_all(&a, &b);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_removal_propagates() {
        let a = Awareness::new(ReplicaId(1));
        let b = Awareness::new(ReplicaId(2));
        sync_all(&a, &b);

        a.remove_states(&[ReplicaId(1)], Origin::Named("process exit"));
        assert_eq!(a.local_state(), None);
        let update = a.encode_update(&[ReplicaId(1)]).unwrap();
        b.apply_update(&update, Origin::Local).unwrap();

        assert_eq!(b.state(ReplicaId(1)), None);
        assert_eq!(b.replica_ids(), vec![ReplicaId(2)]);
    }

    #[test]
    fn test_removed_entry_keeps_clock() {
        let a = Awareness::new(ReplicaId(1));
        let b = Awareness::new(ReplicaId(2));
        a.set_local_state(Some(json!({"v": 1})));
        let before_removal = a.encode_update(&[ReplicaId(1)]).unwrap();
        sync_all(&a, &b);

        a.remove_states(&[ReplicaId(1)], Origin::Local);
        let removal = a.encode_update(&[ReplicaId(1)]).unwrap();
        b.apply_update(&removal, Origin::Local).unwrap();
        assert_eq!(b.state(ReplicaId(1)), None);
        assert_eq!(b.clock(ReplicaId(1)), Some(2));

        // a delayed copy of the old entry must not resurrect it
        b.apply_update(&before_removal, Origin::Local).unwrap();
        assert_eq!(b.state(ReplicaId(1)), None);
    }

    #[test]
    fn test_remote_removal_of_local_entry_is_outbid() {
        let a = Awareness::new(ReplicaId(1));
        let b = Awareness::new(ReplicaId(2));
        sync_all(&a, &b);

        // b forgets a and broadcasts the removal with a's clock
        b.remove_states(&[ReplicaId(1)], Origin::Local);
        let removal = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                replica: ReplicaId(1),
                clock: 1,
                state: "null".to_string(),
            }],
        }
        .encode()
        .unwrap();
        a.apply_update(&removal, Origin::Local).unwrap();

        assert_eq!(a.local_state(), Some(json!({})));
        assert_eq!(a.clock(ReplicaId(1)), Some(2));
    }

    #[test]
    fn test_remove_states_only_reports_present_entries() {
        let a = Awareness::new(ReplicaId(1));
        let seen = recorder(&a);
        a.remove_states(&[ReplicaId(42)], Origin::Local);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_invalid_json_leaves_table_untouched() {
        let b = Awareness::new(ReplicaId(2));
        let update = AwarenessUpdate {
            entries: vec![
                AwarenessEntry {
                    replica: ReplicaId(1),
                    clock: 1,
                    state: "{}".to_string(),
                },
                AwarenessEntry {
                    replica: ReplicaId(3),
                    clock: 1,
                    state: "{not json".to_string(),
                },
            ],
        }
        .encode()
        .unwrap();

        let result = b.apply_update(&update, Origin::Local);
        assert!(matches!(result, Err(SyncError::Presence(_))));
        assert_eq!(b.replica_ids(), vec![ReplicaId(2)]);
    }

    #[test]
    fn test_entry_wire_format() {
        let a = Awareness::new(ReplicaId(5));
        let bytes = a.encode_update(&[ReplicaId(5)]).unwrap();
        // count=1, replica=5, clock=0, "{}"
        assert_eq!(bytes, vec![1, 5, 0, 2, b'{', b'}']);
    }

    #[test]
    fn test_unknown_replica_encodes_as_removal() {
        let a = Awareness::new(ReplicaId(5));
        let bytes = a.encode_update(&[ReplicaId(9)]).unwrap();
        let update = AwarenessUpdate::decode(&bytes).unwrap();
        assert_eq!(update.entries[0].state, "null");
    }
}
