//! Wire messages exchanged between providers
//!
//! Messages are serialized with postcard. Postcard writes enum variant
//! indices and byte-array lengths as LEB128 varints, so the serde enums below
//! produce exactly the framing peers expect:
//!
//! ```text
//! Message      = varuint(kind) • payload
//!
//! kind 0  document-sync    varuint(step) • varuint(len) • bytes
//!                          step 0 = Step1 (state vector)
//!                          step 1 = Step2 (delta answering a Step1)
//!                          step 2 = Update (delta of a local edit)
//! kind 1  presence-query   (no payload)
//! kind 2  presence-update  varuint(len) • presence update bytes
//! kind 3  authorization    varuint(0) • varstring(reason)
//! ```
//!
//! Kinds are stable small integers. A frame with any other kind decodes to
//! [`SyncError::UnknownMessageKind`] so the caller can drop it without
//! treating it as corruption.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::doc::Document;
use crate::error::{SyncError, SyncResult};
use crate::presence::Presence;
use crate::types::{Origin, ReplicaId};

/// The four top-level message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DocumentSync,
    PresenceQuery,
    PresenceUpdate,
    Authorization,
}

impl MessageKind {
    /// The varuint tag written in front of the payload
    pub fn tag(self) -> u64 {
        match self {
            MessageKind::DocumentSync => 0,
            MessageKind::PresenceQuery => 1,
            MessageKind::PresenceUpdate => 2,
            MessageKind::Authorization => 3,
        }
    }

    /// Map a tag back to its kind, `None` for unknown tags
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(MessageKind::DocumentSync),
            1 => Some(MessageKind::PresenceQuery),
            2 => Some(MessageKind::PresenceUpdate),
            3 => Some(MessageKind::Authorization),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::DocumentSync => write!(f, "document-sync"),
            MessageKind::PresenceQuery => write!(f, "presence-query"),
            MessageKind::PresenceUpdate => write!(f, "presence-update"),
            MessageKind::Authorization => write!(f, "authorization"),
        }
    }
}

/// Document-sync sub-messages
///
/// Variant order is the wire sub-type and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Sender's state vector; the receiver answers with a Step2
    Step1(Vec<u8>),
    /// Delta the sender computed against a received state vector
    Step2(Vec<u8>),
    /// Delta of an edit made on the sender's replica
    Update(Vec<u8>),
}

/// Sub-type of a handled [`SyncMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Step1,
    Step2,
    Update,
}

impl SyncMessage {
    /// Which step of the handshake this message is
    pub fn step(&self) -> SyncStep {
        match self {
            SyncMessage::Step1(_) => SyncStep::Step1,
            SyncMessage::Step2(_) => SyncStep::Step2,
            SyncMessage::Update(_) => SyncStep::Update,
        }
    }
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStep::Step1 => write!(f, "step1"),
            SyncStep::Step2 => write!(f, "step2"),
            SyncStep::Update => write!(f, "update"),
        }
    }
}

/// Run one document-sync sub-message against `doc`
///
/// A Step1 is answered with a Step2 holding whatever the sender is missing.
/// Step2 and Update deltas are applied with `origin` and need no answer.
pub fn read_sync_message(
    doc: &dyn Document,
    message: SyncMessage,
    origin: Origin,
) -> SyncResult<Option<SyncMessage>> {
    match message {
        SyncMessage::Step1(state_vector) => Ok(Some(SyncMessage::Step2(
            doc.encode_state_as_update(&state_vector)?,
        ))),
        SyncMessage::Step2(update) | SyncMessage::Update(update) => {
            doc.apply_update(&update, origin)?;
            Ok(None)
        }
    }
}

/// Authorization sub-messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMessage {
    /// The peer refused access, with a human-readable reason
    PermissionDenied(String),
}

/// A decoded wire message
///
/// Variant order is the wire kind tag and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Kind 0
    Sync(SyncMessage),
    /// Kind 1
    QueryAwareness,
    /// Kind 2, payload produced by [`Presence::encode_update`]
    Awareness(Vec<u8>),
    /// Kind 3
    Auth(AuthMessage),
}

impl Message {
    /// Step1 carrying the document's current state vector
    pub fn sync_step1(doc: &dyn Document) -> SyncResult<Self> {
        Ok(Message::Sync(SyncMessage::Step1(doc.state_vector()?)))
    }

    /// Update carrying a local document delta
    pub fn update(update: &[u8]) -> Self {
        Message::Sync(SyncMessage::Update(update.to_vec()))
    }

    /// Presence update scoped to `replicas`
    pub fn awareness_update(presence: &dyn Presence, replicas: &[ReplicaId]) -> SyncResult<Self> {
        Ok(Message::Awareness(presence.encode_update(replicas)?))
    }

    /// Kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Sync(_) => MessageKind::DocumentSync,
            Message::QueryAwareness => MessageKind::PresenceQuery,
            Message::Awareness(_) => MessageKind::PresenceUpdate,
            Message::Auth(_) => MessageKind::Authorization,
        }
    }

    /// Encode message to bytes using postcard
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Encode(e.to_string()))
    }

    /// Decode message from bytes using postcard
    ///
    /// # Errors
    ///
    /// `SyncError::UnknownMessageKind` if the leading tag is not a known
    /// kind, `SyncError::Decode` if the frame is empty, truncated or the
    /// payload is malformed.
    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        let (tag, _) = postcard::take_from_bytes::<u64>(data)
            .map_err(|e| SyncError::Decode(e.to_string()))?;

        if MessageKind::from_tag(tag).is_none() {
            return Err(SyncError::UnknownMessageKind(tag));
        }

        postcard::from_bytes(data).map_err(|e| SyncError::Decode(e.to_string()))
    }
}
