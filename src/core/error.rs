//! Error taxonomy of the mesh protocol.
//!
//! Every variant aborts at most one transfer, retrieval or connection; none
//! of them tears the node down. The node surfaces them to the UI as
//! [`UiEvent::Error`](crate::core::node::UiEvent::Error).

use crate::core::connection::{PeerId, TransportError};
use crate::core::library::FileKey;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    /// No open event within the connect bound.
    #[error("connection to {peer} was not opened in time")]
    ConnectTimeout { peer: PeerId },

    /// The channel stopped being open in the middle of a transfer.
    #[error("channel to {peer} closed mid-transfer")]
    ChannelClosed { peer: PeerId },

    /// Reassembled byte count differs from the declared size.
    #[error("size mismatch for {file}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: FileKey,
        expected: u64,
        actual: u64,
    },

    /// A forwarded request could not be answered by the holder.
    #[error("holder {holder} of {file} cannot reach the requester")]
    HolderUnreachable { file: FileKey, holder: PeerId },

    /// A file send failed for every target.
    #[error("sending {file} failed for every recipient")]
    AllRecipientsFailed { file: FileKey },

    /// Duplicate connect for a peer that already has a live connection.
    #[error("already connected to {peer}")]
    AlreadyConnected { peer: PeerId },

    /// A local share whose key is already recorded under another holder.
    #[error("{file} is already shared by {holder}")]
    KeyCollision { file: FileKey, holder: PeerId },

    /// Download requested for a key this peer never learned about.
    #[error("unknown file {file}")]
    UnknownFile { file: FileKey },

    /// A holder answered a request with a `blob-error`.
    #[error("{file} is unavailable: {reason}")]
    BlobUnavailable { file: FileKey, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("message codec: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
