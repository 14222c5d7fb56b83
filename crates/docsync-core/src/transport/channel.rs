//! Broadcast-channel transport
//!
//! Every provider attached to the same `tokio::sync::broadcast` sender sees
//! every frame, including its own. Inbound frames are handled on a spawned
//! task in channel order.
//!
//! A receiver that falls behind loses frames. Once it has drained what is
//! still buffered it sends a Step1, and the peers' Step2 answers fill the gap.
//!
//! ```text
//!   provider A ──on_broadcast──▶ Sender<WireFrame> ──▶ Receiver (task) ──▶ provider B
//! ```

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::sync::{SyncProvider, Topic};
use crate::types::{ReplicaId, SubscriptionId};

/// Capacity used by [`ChannelTransport::channel`]
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// One frame on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub origin: ReplicaId,
    pub payload: Bytes,
}

struct Attachment {
    outbound: SubscriptionId,
    receiver_task: JoinHandle<()>,
}

/// Binds one provider to a broadcast channel
pub struct ChannelTransport {
    provider: Arc<SyncProvider>,
    attachment: Mutex<Option<Attachment>>,
}

impl ChannelTransport {
    /// Create a channel providers can share
    pub fn channel() -> broadcast::Sender<WireFrame> {
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        sender
    }

    /// Attach `provider` to the channel behind `sender`
    ///
    /// # Errors
    ///
    /// `SyncError::Runtime` if called outside a tokio runtime.
    pub fn connect(
        sender: &broadcast::Sender<WireFrame>,
        provider: Arc<SyncProvider>,
    ) -> SyncResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::Runtime(format!("channel transport needs a tokio runtime: {}", e)))?;

        provider.announce_connecting();

        let receiver_task = runtime.spawn(receive_loop(
            sender.subscribe(),
            Arc::downgrade(&provider),
            provider.id(),
        ));

        let outbound = {
            let sender = sender.clone();
            provider.events().on_broadcast(move |message| {
                // Err only means no receiver is left
                let _ = sender.send(WireFrame {
                    origin: message.origin,
                    payload: message.payload.clone(),
                });
            })
        };

        provider.announce_connected();

        Ok(Self {
            provider,
            attachment: Mutex::new(Some(Attachment {
                outbound,
                receiver_task,
            })),
        })
    }

    pub fn provider(&self) -> &Arc<SyncProvider> {
        &self.provider
    }

    pub fn is_connected(&self) -> bool {
        self.attachment.lock().is_some()
    }

    /// Detach from the channel. Calling it again does nothing.
    pub fn disconnect(&self) {
        let Some(attachment) = self.attachment.lock().take() else {
            return;
        };

        debug!(replica = %self.provider.id(), "Detaching from channel");
        attachment.receiver_task.abort();
        self.provider.events().off(Topic::Broadcast, attachment.outbound);
        self.provider.announce_disconnected();
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn receive_loop(
    mut receiver: broadcast::Receiver<WireFrame>,
    provider: Weak<SyncProvider>,
    replica: ReplicaId,
) {
    debug!(%replica, "Channel receiver started");

    // Resyncing while frames are still queued would evict the next one
    // and lag again, so wait until the backlog is drained
    let mut lagged = false;

    loop {
        match receiver.recv().await {
            Ok(frame) => {
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                if let Err(e) = provider.on_message(&frame.payload, frame.origin) {
                    warn!(%replica, origin = %frame.origin, error = %e, "Dropping malformed frame");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(%replica, missed = n, "Channel receiver lagged, frames skipped");
                lagged = true;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(%replica, "Channel closed, stopping receiver");
                break;
            }
        }

        if lagged && receiver.is_empty() {
            let Some(provider) = provider.upgrade() else {
                break;
            };
            lagged = false;
            debug!(%replica, "Resyncing after lag");
            provider.resync();
        }
    }
}
