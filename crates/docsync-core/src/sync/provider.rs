//! Sync provider: the orchestrator between a document, its presence table
//! and whatever transport carries bytes between replicas
//!
//! ## Features
//!
//! - Broadcast local document edits and presence changes
//! - Dispatch inbound messages by kind and answer handshakes
//! - Track connection status and the synced flag
//! - Re-send a Step1 on a fixed interval to recover from dropped messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncProvider                                                    │
//! │  ├── doc: Arc<dyn Document>                                      │
//! │  │   └── update listener → Update broadcast (unless self-origin) │
//! │  ├── presence: Arc<dyn Presence>                                 │
//! │  │   └── update listener → presence-update broadcast             │
//! │  ├── state: connected / synced / ConnectionStatus                │
//! │  ├── resync task: Step1 broadcast every interval                 │
//! │  └── events: EventBus                                            │
//! │      └── Broadcast / Status / Synced / Sync topics               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! No lock is held while listeners run, so a transport may feed a response
//! straight back into `on_message` from inside a broadcast listener.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use super::events::{ConnectionStatus, EventBus, OutboundMessage, ProviderEvent};
use super::protocol::{read_sync_message, AuthMessage, Message, SyncStep};
use crate::doc::{DocUpdate, Document};
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::ExitHooks;
use crate::presence::{Awareness, Presence, PresenceChange};
use crate::types::{Origin, ProviderId, ReplicaId, SubscriptionId};

/// Origin used when the exit hook removes the local presence entry
pub const EXIT_ORIGIN: Origin = Origin::Named("process exit");

/// Provider configuration
///
/// Only `resync_interval_ms` can come from a config file; the object
/// handles are supplied in code.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Existing presence table; a fresh [`Awareness`] is created if absent
    #[serde(skip)]
    pub presence: Option<Arc<dyn Presence>>,
    /// Resync period in milliseconds; absent or non-positive disables resync
    pub resync_interval_ms: Option<i64>,
    /// Registry the provider adds its presence-removal hook to
    #[serde(skip)]
    pub exit_hooks: Option<Arc<ExitHooks>>,
}

impl ProviderConfig {
    /// Use an existing presence table
    pub fn with_presence(mut self, presence: Arc<dyn Presence>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Enable periodic resync
    pub fn with_resync_interval_ms(mut self, interval_ms: u64) -> Self {
        self.resync_interval_ms = Some(i64::try_from(interval_ms).unwrap_or(i64::MAX));
        self
    }

    /// Remove the local presence entry when `hooks` fire
    pub fn with_exit_hooks(mut self, hooks: Arc<ExitHooks>) -> Self {
        self.exit_hooks = Some(hooks);
        self
    }

    /// Effective resync period, `None` when disabled
    pub fn resync_interval(&self) -> Option<Duration> {
        self.resync_interval_ms
            .filter(|ms| *ms > 0)
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("presence", &self.presence.is_some())
            .field("resync_interval_ms", &self.resync_interval_ms)
            .field("exit_hooks", &self.exit_hooks.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    connected: bool,
    synced: bool,
    status: ConnectionStatus,
}

/// Everything `destroy` has to undo
struct Wiring {
    doc_subscription: SubscriptionId,
    presence_subscription: SubscriptionId,
    exit_hook: Option<(Arc<ExitHooks>, SubscriptionId)>,
    resync_task: Option<JoinHandle<()>>,
}

/// Orchestrates synchronization of one document replica
///
/// # Example
///
/// ```ignore
/// let doc = Arc::new(AutomergeDoc::new());
/// let provider = SyncProvider::new(doc.clone(), ProviderConfig::default())?;
///
/// // Ship outbound bytes
/// provider.events().on_broadcast(move |message| transport.send(message.payload.clone()));
///
/// // Feed inbound bytes
/// provider.on_message(&bytes, sender)?;
///
/// provider.announce_connecting();
/// provider.announce_connected();
/// ```
pub struct SyncProvider {
    id: ReplicaId,
    provider_id: ProviderId,
    doc: Arc<dyn Document>,
    presence: Arc<dyn Presence>,
    events: Arc<EventBus>,
    state: Mutex<SessionState>,
    wiring: Mutex<Option<Wiring>>,
}

impl SyncProvider {
    /// Create a provider and wire it to the document and presence table
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Runtime` if a resync interval is configured but
    /// no tokio runtime is running.
    pub fn new(doc: Arc<dyn Document>, config: ProviderConfig) -> SyncResult<Arc<Self>> {
        let id = doc.replica_id();
        let provider_id = ProviderId::next();
        info!(replica = %id, %provider_id, "Initializing sync provider");

        let resync = match config.resync_interval() {
            Some(period) => {
                let runtime = Handle::try_current().map_err(|e| {
                    SyncError::Runtime(format!("resync needs a tokio runtime: {}", e))
                })?;
                Some((runtime, period))
            }
            None => None,
        };

        let presence = config
            .presence
            .clone()
            .unwrap_or_else(|| Arc::new(Awareness::new(id)));
        let events = Arc::new(EventBus::new());

        let doc_subscription = {
            let events = events.clone();
            doc.subscribe(Arc::new(move |update: &DocUpdate| {
                if update.origin == Origin::Provider(provider_id) {
                    return;
                }
                debug!(
                    replica = %id,
                    origin = %update.origin,
                    bytes = update.update.len(),
                    "Document updated locally, broadcasting update to peers"
                );
                broadcast(&events, id, &Message::update(&update.update));
            }))
        };

        let presence_subscription = {
            let events = events.clone();
            let presence_ref = Arc::downgrade(&presence);
            presence.subscribe(Arc::new(move |change: &PresenceChange| {
                let Some(presence) = presence_ref.upgrade() else {
                    return;
                };
                match Message::awareness_update(&*presence, &change.changed()) {
                    Ok(message) => broadcast(&events, id, &message),
                    Err(e) => error!(replica = %id, error = %e, "Failed to encode presence update"),
                }
            }))
        };

        let resync_task = resync.map(|(runtime, period)| {
            let doc = doc.clone();
            let events = events.clone();
            runtime.spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    debug!(replica = %id, "Resyncing (resync interval elapsed)");
                    broadcast_step1(&*doc, &events, id);
                }
            })
        });

        let exit_hook = config.exit_hooks.map(|hooks| {
            let presence_ref = Arc::downgrade(&presence);
            let hook = hooks.register(move || {
                if let Some(presence) = presence_ref.upgrade() {
                    presence.remove_states(&[id], EXIT_ORIGIN);
                }
            });
            (hooks, hook)
        });

        Ok(Arc::new(Self {
            id,
            provider_id,
            doc,
            presence,
            events,
            state: Mutex::new(SessionState::default()),
            wiring: Mutex::new(Some(Wiring {
                doc_subscription,
                presence_subscription,
                exit_hook,
                resync_task,
            })),
        }))
    }

    /// Replica id of the wrapped document
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Origin marker this provider stamps on changes it applies
    pub fn origin(&self) -> Origin {
        Origin::Provider(self.provider_id)
    }

    /// Event registry transports and observers subscribe to
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The wrapped document
    pub fn doc(&self) -> &Arc<dyn Document> {
        &self.doc
    }

    /// The presence table
    pub fn presence(&self) -> &Arc<dyn Presence> {
        &self.presence
    }

    /// Whether a transport announced a live session
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Whether a handshake with a peer completed since the last disconnect
    pub fn is_synced(&self) -> bool {
        self.state.lock().synced
    }

    /// Last announced connection status
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Whether `destroy` has run
    pub fn is_destroyed(&self) -> bool {
        self.wiring.lock().is_none()
    }

    /// Set the synced flag, emitting `Synced` and `Sync` only on change
    pub fn set_synced(&self, synced: bool) {
        {
            let mut state = self.state.lock();
            if state.synced == synced {
                return;
            }
            state.synced = synced;
        }

        debug!(replica = %self.id, synced, "Setting sync state");
        self.events.emit(&ProviderEvent::Synced(synced));
        self.events.emit(&ProviderEvent::Sync(synced));
    }

    /// Transport started establishing a session
    pub fn announce_connecting(&self) {
        {
            let mut state = self.state.lock();
            if state.connected {
                return;
            }
            state.status = ConnectionStatus::Connecting;
        }

        info!(replica = %self.id, "Connecting");
        self.events
            .emit(&ProviderEvent::Status(ConnectionStatus::Connecting));
    }

    /// Transport session is up: request sync and advertise presence
    pub fn announce_connected(&self) {
        {
            let mut state = self.state.lock();
            state.connected = true;
            state.status = ConnectionStatus::Connected;
        }

        info!(replica = %self.id, "Connected");
        self.events
            .emit(&ProviderEvent::Status(ConnectionStatus::Connected));

        self.resync();

        if self.presence.local_state().is_some() {
            match Message::awareness_update(&*self.presence, &[self.id]) {
                Ok(message) => broadcast(&self.events, self.id, &message),
                Err(e) => error!(replica = %self.id, error = %e, "Failed to encode local presence"),
            }
        }
    }

    /// Transport session is gone
    ///
    /// Drops the synced flag before clearing remote presence so observers
    /// never see peers vanish while still synced. The local entry stays.
    pub fn announce_disconnected(&self) {
        info!(replica = %self.id, "Disconnected");

        self.set_synced(false);

        let remote: Vec<ReplicaId> = self
            .presence
            .replica_ids()
            .into_iter()
            .filter(|replica| *replica != self.id)
            .collect();
        self.presence.remove_states(&remote, self.origin());

        let was_connected = {
            let mut state = self.state.lock();
            let was_connected = state.connected;
            if was_connected {
                state.connected = false;
                state.status = ConnectionStatus::Disconnected;
            }
            was_connected
        };

        if was_connected {
            self.events
                .emit(&ProviderEvent::Status(ConnectionStatus::Disconnected));
        }
    }

    /// Broadcast a fresh Step1
    pub fn resync(&self) {
        broadcast_step1(&*self.doc, &self.events, self.id);
    }

    /// Handle bytes a transport received from `origin`
    ///
    /// Messages from this replica are ignored. Unknown message kinds are
    /// logged and dropped.
    ///
    /// # Errors
    ///
    /// `SyncError::Decode`, `SyncError::Automerge` or `SyncError::Presence`
    /// if the frame or its payload is malformed. Transports must relay bytes
    /// unchanged; these are integrity failures, not protocol conditions.
    pub fn on_message(&self, message: &[u8], origin: ReplicaId) -> SyncResult<()> {
        if origin == self.id {
            return Ok(());
        }

        debug!(replica = %self.id, %origin, bytes = message.len(), "Received message");

        let message = match Message::decode(message) {
            Ok(message) => message,
            Err(SyncError::UnknownMessageKind(kind)) => {
                error!(replica = %self.id, %origin, kind, "Unable to compute message");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let response = match message {
            Message::Sync(sync) => {
                let step = sync.step();
                let reply = read_sync_message(&*self.doc, sync, self.origin())?;
                debug!(replica = %self.id, %step, "Processed document-sync message");

                if step == SyncStep::Step2 && !self.is_synced() {
                    self.set_synced(true);
                }
                reply.map(Message::Sync)
            }
            Message::QueryAwareness => {
                let replicas = self.presence.replica_ids();
                debug!(replica = %self.id, known = replicas.len(), "Processed presence query");
                Some(Message::awareness_update(&*self.presence, &replicas)?)
            }
            Message::Awareness(update) => {
                self.presence.apply_update(&update, self.origin())?;
                debug!(replica = %self.id, "Processed presence update");
                None
            }
            Message::Auth(AuthMessage::PermissionDenied(reason)) => {
                warn!(replica = %self.id, %origin, %reason, "Permission denied to channel");
                None
            }
        };

        if let Some(response) = response {
            debug!(replica = %self.id, kind = %response.kind(), "Broadcasting response");
            broadcast(&self.events, self.id, &response);
        }

        Ok(())
    }

    /// Stop the resync task and detach from the document, presence table
    /// and exit hooks. Calling it again does nothing.
    pub fn destroy(&self) {
        let Some(wiring) = self.wiring.lock().take() else {
            return;
        };

        debug!(replica = %self.id, "Destroying sync provider");

        if let Some(task) = wiring.resync_task {
            task.abort();
        }
        if let Some((hooks, hook)) = wiring.exit_hook {
            hooks.unregister(hook);
        }
        self.presence.unsubscribe(wiring.presence_subscription);
        self.doc.unsubscribe(wiring.doc_subscription);
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn broadcast(events: &EventBus, origin: ReplicaId, message: &Message) {
    match message.encode() {
        Ok(payload) => events.emit(&ProviderEvent::Broadcast(OutboundMessage {
            kind: message.kind(),
            payload: Bytes::from(payload),
            origin,
        })),
        Err(e) => error!(replica = %origin, error = %e, "Failed to encode outbound message"),
    }
}

fn broadcast_step1(doc: &dyn Document, events: &EventBus, origin: ReplicaId) {
    match Message::sync_step1(doc) {
        Ok(message) => broadcast(events, origin, &message),
        Err(e) => error!(replica = %origin, error = %e, "Failed to build sync step 1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::AutomergeDoc;
    use crate::sync::events::Topic;
    use crate::sync::protocol::SyncMessage;

    fn provider(id: u64) -> (Arc<AutomergeDoc>, Arc<SyncProvider>) {
        let doc = Arc::new(AutomergeDoc::with_replica_id(ReplicaId(id)));
        let provider = SyncProvider::new(doc.clone(), ProviderConfig::default()).unwrap();
        (doc, provider)
    }

    fn record(provider: &SyncProvider, topic: Topic) -> Arc<Mutex<Vec<ProviderEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        provider
            .events()
            .on(topic, move |event| sink.lock().push(event.clone()));
        seen
    }

    #[test]
    fn test_new_captures_replica_id() {
        let (_, provider) = provider(11);
        assert_eq!(provider.id(), ReplicaId(11));
        assert_eq!(provider.presence().replica_id(), ReplicaId(11));
        assert_eq!(provider.status(), ConnectionStatus::Idle);
        assert!(!provider.is_synced());
    }

    #[test]
    fn test_set_synced_emits_both_events_once() {
        let (_, provider) = provider(1);
        let synced = record(&provider, Topic::Synced);
        let sync = record(&provider, Topic::Sync);

        provider.set_synced(true);
        provider.set_synced(true);

        assert_eq!(*synced.lock(), vec![ProviderEvent::Synced(true)]);
        assert_eq!(*sync.lock(), vec![ProviderEvent::Sync(true)]);
    }

    #[test]
    fn test_set_synced_false_when_already_false_is_silent() {
        let (_, provider) = provider(1);
        let synced = record(&provider, Topic::Synced);
        provider.set_synced(false);
        assert!(synced.lock().is_empty());
    }

    #[test]
    fn test_announce_connecting_is_noop_when_connected() {
        let (_, provider) = provider(1);
        let status = record(&provider, Topic::Status);

        provider.announce_connecting();
        provider.announce_connected();
        provider.announce_connecting();

        assert_eq!(
            *status.lock(),
            vec![
                ProviderEvent::Status(ConnectionStatus::Connecting),
                ProviderEvent::Status(ConnectionStatus::Connected),
            ]
        );
        assert_eq!(provider.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_disconnect_without_connect_emits_no_status() {
        let (_, provider) = provider(1);
        let status = record(&provider, Topic::Status);
        provider.announce_disconnected();
        assert!(status.lock().is_empty());
        assert!(!provider.is_connected());
    }

    #[test]
    fn test_reconnect_after_disconnect() {
        let (_, provider) = provider(1);
        provider.announce_connected();
        provider.announce_disconnected();
        assert_eq!(provider.status(), ConnectionStatus::Disconnected);

        provider.announce_connecting();
        provider.announce_connected();
        assert!(provider.is_connected());
        assert_eq!(provider.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_self_origin_message_is_ignored() {
        let (doc, provider) = provider(1);
        let broadcasts = record(&provider, Topic::Broadcast);

        let peer = AutomergeDoc::with_replica_id(ReplicaId(2));
        peer.put("key", 1i64).unwrap();
        let delta = peer
            .encode_state_as_update(&doc.state_vector().unwrap())
            .unwrap();
        let bytes = Message::Sync(SyncMessage::Step2(delta)).encode().unwrap();

        provider.on_message(&bytes, ReplicaId(1)).unwrap();

        assert!(broadcasts.lock().is_empty());
        assert!(!provider.is_synced());
        assert_eq!(doc.get("key").unwrap(), None);
    }

    #[test]
    fn test_step1_is_answered() {
        let (_, provider) = provider(1);
        let broadcasts = record(&provider, Topic::Broadcast);

        let peer = AutomergeDoc::with_replica_id(ReplicaId(2));
        let bytes = Message::sync_step1(&peer).unwrap().encode().unwrap();
        provider.on_message(&bytes, ReplicaId(2)).unwrap();

        let broadcasts = broadcasts.lock();
        assert_eq!(broadcasts.len(), 1);
        let ProviderEvent::Broadcast(message) = &broadcasts[0] else {
            panic!("expected a broadcast");
        };
        assert_eq!(message.origin, ReplicaId(1));
        assert!(matches!(
            Message::decode(&message.payload).unwrap(),
            Message::Sync(SyncMessage::Step2(_))
        ));
        // answering a step1 does not make us synced
        assert!(!provider.is_synced());
    }

    #[test]
    fn test_update_does_not_set_synced() {
        let (doc, provider) = provider(1);
        let peer = AutomergeDoc::with_replica_id(ReplicaId(2));
        peer.put("key", 1i64).unwrap();
        let delta = peer
            .encode_state_as_update(&doc.state_vector().unwrap())
            .unwrap();

        let bytes = Message::update(&delta).encode().unwrap();
        provider.on_message(&bytes, ReplicaId(2)).unwrap();

        assert!(!provider.is_synced());
        assert_eq!(doc.get("key").unwrap(), Some(serde_json::json!(1)));
    }

    #[test]
    fn test_applied_remote_update_is_not_rebroadcast() {
        let (doc, provider) = provider(1);
        let broadcasts = record(&provider, Topic::Broadcast);

        let peer = AutomergeDoc::with_replica_id(ReplicaId(2));
        peer.put("key", 1i64).unwrap();
        let delta = peer
            .encode_state_as_update(&doc.state_vector().unwrap())
            .unwrap();
        provider
            .on_message(&Message::update(&delta).encode().unwrap(), ReplicaId(2))
            .unwrap();

        assert!(broadcasts.lock().is_empty());

        // a local edit is broadcast
        doc.put("mine", 2i64).unwrap();
        assert_eq!(broadcasts.lock().len(), 1);
    }

    #[test]
    fn test_permission_denied_only_logs() {
        let (_, provider) = provider(1);
        let broadcasts = record(&provider, Topic::Broadcast);

        let bytes = Message::Auth(AuthMessage::PermissionDenied("read only".into()))
            .encode()
            .unwrap();
        provider.on_message(&bytes, ReplicaId(2)).unwrap();

        assert!(broadcasts.lock().is_empty());
        assert_eq!(provider.status(), ConnectionStatus::Idle);
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        let (_, provider) = provider(1);
        let result = provider.on_message(&[0, 1, 200], ReplicaId(2));
        assert!(matches!(result, Err(SyncError::Decode(_))));
    }

    #[test]
    fn test_resync_without_runtime_fails() {
        let doc = Arc::new(AutomergeDoc::new());
        let result = SyncProvider::new(
            doc.clone(),
            ProviderConfig::default().with_resync_interval_ms(50),
        );
        assert!(matches!(result, Err(SyncError::Runtime(_))));
    }

    #[test]
    fn test_zero_interval_disables_resync() {
        let config = ProviderConfig::default().with_resync_interval_ms(0);
        assert_eq!(config.resync_interval(), None);

        // no runtime needed
        let doc = Arc::new(AutomergeDoc::new());
        assert!(SyncProvider::new(doc, config).is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config: ProviderConfig =
            serde_json::from_str(r#"{"resync_interval_ms": 250}"#).unwrap();
        assert_eq!(config.resync_interval(), Some(Duration::from_millis(250)));
        assert!(config.presence.is_none());

        let empty: ProviderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.resync_interval(), None);
    }

    #[test]
    fn test_config_non_positive_interval_disables_resync() {
        for raw in [r#"{"resync_interval_ms": -5}"#, r#"{"resync_interval_ms": 0}"#] {
            let config: ProviderConfig = serde_json::from_str(raw).unwrap();
            assert_eq!(config.resync_interval(), None);

            // no runtime needed
            let doc = Arc::new(AutomergeDoc::new());
            assert!(SyncProvider::new(doc, config).is_ok());
        }
    }

    #[test]
    fn test_destroy_twice() {
        let (doc, provider) = provider(1);
        let broadcasts = record(&provider, Topic::Broadcast);

        provider.destroy();
        provider.destroy();
        assert!(provider.is_destroyed());

        doc.put("after", 1i64).unwrap();
        assert!(broadcasts.lock().is_empty());
    }

    #[test]
    fn test_exit_hook_removes_local_presence() {
        let doc = Arc::new(AutomergeDoc::with_replica_id(ReplicaId(1)));
        let hooks = ExitHooks::new();
        let provider = SyncProvider::new(
            doc,
            ProviderConfig::default().with_exit_hooks(hooks.clone()),
        )
        .unwrap();
        let broadcasts = record(&provider, Topic::Broadcast);

        hooks.fire();

        assert_eq!(provider.presence().local_state(), None);
        let broadcasts = broadcasts.lock();
        assert_eq!(broadcasts.len(), 1);
        let ProviderEvent::Broadcast(message) = &broadcasts[0] else {
            panic!("expected a broadcast");
        };
        assert_eq!(message.kind, crate::sync::protocol::MessageKind::PresenceUpdate);
    }

    #[test]
    fn test_destroy_unregisters_exit_hook() {
        let doc = Arc::new(AutomergeDoc::new());
        let hooks = ExitHooks::new();
        let provider = SyncProvider::new(
            doc,
            ProviderConfig::default().with_exit_hooks(hooks.clone()),
        )
        .unwrap();
        assert_eq!(hooks.len(), 1);

        provider.destroy();
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_drop_detaches_from_document() {
        let doc = Arc::new(AutomergeDoc::new());
        let provider = SyncProvider::new(doc.clone(), ProviderConfig::default()).unwrap();
        drop(provider);

        // no listener left to run
        doc.put("key", 1i64).unwrap();
        assert_eq!(Arc::strong_count(&doc), 1);
    }
}
