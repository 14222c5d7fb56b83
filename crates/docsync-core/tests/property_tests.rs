//! Property-based tests for the provider
//!
//! Uses proptest to check dispatch and convergence properties over
//! arbitrary inputs.

use std::sync::Arc;

use docsync_core::presence::Awareness;
use docsync_core::{
    AutomergeDoc, Message, MessageKind, Origin, Presence, ProviderConfig, ReplicaId,
    SyncProvider,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Strategy Generators
// ============================================================================

/// Tags outside the four known kinds
fn unknown_tag_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![4u64..128, 128u64..16_384, 16_384u64..u64::MAX]
}

fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("valid regex")
}

/// An edit made on one of two replicas
#[derive(Debug, Clone)]
struct Edit {
    on_first: bool,
    key: String,
    value: i64,
}

fn edits_strategy(max: usize) -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(
        (any::<bool>(), key_strategy(), any::<i64>()).prop_map(|(on_first, key, value)| Edit {
            on_first,
            key,
            value,
        }),
        0..max,
    )
}

fn varuint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

fn replica(id: u64) -> (Arc<AutomergeDoc>, Arc<SyncProvider>) {
    let doc = Arc::new(AutomergeDoc::with_replica_id(ReplicaId(id)));
    let provider = SyncProvider::new(doc.clone(), ProviderConfig::default()).unwrap();
    (doc, provider)
}

fn broadcast_count(provider: &SyncProvider) -> Arc<Mutex<usize>> {
    let count = Arc::new(Mutex::new(0));
    let counter = count.clone();
    provider.events().on_broadcast(move |_| *counter.lock() += 1);
    count
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Any frame claiming to come from ourselves changes nothing
    #[test]
    fn self_origin_is_noop(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let (doc, provider) = replica(1);
        let count = broadcast_count(&provider);
        let before = doc.save();

        prop_assert!(provider.on_message(&bytes, ReplicaId(1)).is_ok());

        prop_assert_eq!(*count.lock(), 0);
        prop_assert_eq!(doc.save(), before);
        prop_assert!(!provider.is_synced());
    }

    /// Unknown kinds are dropped without error or broadcast
    #[test]
    fn unknown_kind_is_dropped(
        tag in unknown_tag_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..16),
    ) {
        let (_, provider) = replica(1);
        let count = broadcast_count(&provider);

        let mut frame = varuint(tag);
        frame.extend(payload);

        prop_assert!(provider.on_message(&frame, ReplicaId(2)).is_ok());
        prop_assert_eq!(*count.lock(), 0);
    }

    /// Arbitrary bytes never panic the dispatcher
    #[test]
    fn arbitrary_bytes_do_not_panic(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let (_, provider) = replica(1);
        let _ = provider.on_message(&bytes, ReplicaId(2));
    }

    /// A presence-query answer populates exactly the replicas it encodes
    #[test]
    fn presence_answer_populates_encoded_replicas(ids in prop::collection::btree_set(10u64..1000, 0..8)) {
        let (_, asked) = replica(1);

        // teach the asked replica about every id
        for id in &ids {
            let peer = Awareness::new(ReplicaId(*id));
            peer.set_local_state_field("id", json!(id));
            let update = Message::awareness_update(&peer, &[ReplicaId(*id)]).unwrap();
            asked.on_message(&update.encode().unwrap(), ReplicaId(*id)).unwrap();
        }

        let answers = Arc::new(Mutex::new(Vec::new()));
        let sink = answers.clone();
        asked.events().on_broadcast(move |message| sink.lock().push(message.clone()));
        asked
            .on_message(&Message::QueryAwareness.encode().unwrap(), ReplicaId(2))
            .unwrap();

        let answers = answers.lock();
        prop_assert_eq!(answers.len(), 1);
        prop_assert_eq!(answers[0].kind, MessageKind::PresenceUpdate);

        let observer = Awareness::new(ReplicaId(5));
        let Message::Awareness(update) = Message::decode(&answers[0].payload).unwrap() else {
            panic!("expected a presence update");
        };
        observer.apply_update(&update, Origin::Local).unwrap();

        let mut expected: Vec<ReplicaId> = ids.iter().copied().map(ReplicaId).collect();
        expected.push(ReplicaId(5));
        expected.sort();
        prop_assert_eq!(observer.replica_ids(), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Two wired replicas converge whatever edits happen on either side
    #[test]
    fn wired_replicas_converge(edits in edits_strategy(12)) {
        let (doc_a, a) = replica(1);
        let (doc_b, b) = replica(2);
        {
            let b = Arc::downgrade(&b);
            a.events().on_broadcast(move |m| {
                if let Some(b) = b.upgrade() {
                    b.on_message(&m.payload, m.origin).unwrap();
                }
            });
        }
        {
            let a = Arc::downgrade(&a);
            b.events().on_broadcast(move |m| {
                if let Some(a) = a.upgrade() {
                    a.on_message(&m.payload, m.origin).unwrap();
                }
            });
        }
        a.announce_connected();
        b.announce_connected();

        for edit in &edits {
            let doc = if edit.on_first { &doc_a } else { &doc_b };
            doc.put(&edit.key, edit.value).unwrap();
        }

        prop_assert_eq!(doc_a.to_json().unwrap(), doc_b.to_json().unwrap());
        prop_assert!(a.is_synced() && b.is_synced());
    }

    /// Replicas that edited while apart converge after one handshake
    #[test]
    fn offline_edits_converge_on_connect(edits in edits_strategy(12)) {
        let (doc_a, a) = replica(1);
        let (doc_b, b) = replica(2);

        for edit in &edits {
            let doc = if edit.on_first { &doc_a } else { &doc_b };
            doc.put(&edit.key, edit.value).unwrap();
        }

        {
            let b = Arc::downgrade(&b);
            a.events().on_broadcast(move |m| {
                if let Some(b) = b.upgrade() {
                    b.on_message(&m.payload, m.origin).unwrap();
                }
            });
        }
        {
            let a = Arc::downgrade(&a);
            b.events().on_broadcast(move |m| {
                if let Some(a) = a.upgrade() {
                    a.on_message(&m.payload, m.origin).unwrap();
                }
            });
        }
        a.announce_connected();
        b.announce_connected();

        prop_assert_eq!(doc_a.to_json().unwrap(), doc_b.to_json().unwrap());
    }
}
