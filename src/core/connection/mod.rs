//! Transport primitive: the black-box "peer connection" the mesh runs on.
//!
//! A [`Transport`] opens [`Channel`]s to remote peers and reports everything
//! that happens to them (open, data, close, error, inbound channels) as
//! [`TransportEvent`]s on a single queue. The node consumes that queue on one
//! logical thread, so channel callbacks never touch mesh state directly.
//!
//! Implementations:
//! - `sim`: deterministic in-process network, test builds only.
//! - [`webrtc`]: one ordered, reliable `RTCDataChannel` per remote peer.

#[cfg(test)]
pub mod sim;
pub mod webrtc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Opaque, session-unique peer identifier assigned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier for transports that do not assign one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Process-unique identity of one channel instance.
///
/// A peer may be served by several channels over its lifetime (reconnects);
/// events carry the channel id so late events from a replaced channel can be
/// told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel is not open")]
    NotOpen,
    #[error("peer {0} cannot be reached by the transport")]
    Unreachable(PeerId),
    #[error("channel closed: {0}")]
    Closed(String),
}

// ── Channel / Transport ──────────────────────────────────────────────────────

/// One bidirectional, ordered, reliable message channel to a remote peer.
pub trait Channel: Send + Sync {
    fn peer(&self) -> &PeerId;

    fn id(&self) -> ChannelId;

    fn is_open(&self) -> bool;

    /// Queue one frame for delivery. Never blocks; frames sent on the same
    /// channel are delivered in call order.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// Connection factory. Identity is assigned by the transport.
pub trait Transport: Send + Sync {
    fn local_id(&self) -> &PeerId;

    /// Start connecting to `peer`. The returned channel is still connecting;
    /// readiness is reported later as [`TransportEvent::Open`].
    fn connect(&self, peer: &PeerId) -> Result<Arc<dyn Channel>, TransportError>;
}

/// Everything a transport reports to the node.
pub enum TransportEvent {
    /// A remote peer opened a channel to us.
    Incoming(Arc<dyn Channel>),
    Open {
        peer: PeerId,
        channel: ChannelId,
    },
    Data {
        peer: PeerId,
        channel: ChannelId,
        frame: Bytes,
    },
    Closed {
        peer: PeerId,
        channel: ChannelId,
    },
    Error {
        peer: PeerId,
        channel: ChannelId,
        error: String,
    },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incoming(ch) => write!(f, "Incoming({} {})", ch.peer(), ch.id()),
            Self::Open { peer, channel } => write!(f, "Open({peer} {channel})"),
            Self::Data {
                peer,
                channel,
                frame,
            } => write!(f, "Data({peer} {channel} {} bytes)", frame.len()),
            Self::Closed { peer, channel } => write!(f, "Closed({peer} {channel})"),
            Self::Error {
                peer,
                channel,
                error,
            } => write!(f, "Error({peer} {channel}: {error})"),
        }
    }
}
