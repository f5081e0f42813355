//! Wire protocol: the message envelope exchanged on every mesh channel.
//!
//! Each frame is one JSON object whose `type` field names the message kind.
//! Field names are camelCase and chunk payloads are base64, so the frames are
//! readable by browser peers speaking the same protocol.
//!
//! Message kinds:
//!
//! | type                      | direction            | purpose                                  |
//! |---------------------------|----------------------|------------------------------------------|
//! | `file-info`               | any → any            | metadata announcement, no bytes          |
//! | `file-header`             | sender → receiver    | opens a transfer session                 |
//! | `file-chunk`              | sender → receiver    | one byte range of the file               |
//! | `file-complete`           | sender → receiver    | closes and validates the session         |
//! | `blob-request`            | requester → holder   | ask for a file's bytes                   |
//! | `blob-request-forwarded`  | relay → holder       | request relayed on behalf of requester   |
//! | `blob-error`              | holder → requester   | content cannot be served                 |
//! | `connection-notification` | both, on open        | announces the sender's identity          |
//! | `keep-alive(-response)`   | both                 | liveness probe                           |
//! | `disconnect-notification` | leaving peer → all   | graceful teardown                        |

use crate::core::connection::PeerId;
use crate::core::error::MeshResult;
use crate::core::library::{FileKey, FileMeta};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Serialize chunk payloads as base64 strings rather than JSON number arrays.
mod base64_bytes {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&b64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Why a holder refused a blob request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlobErrorCode {
    /// The holder has no bytes for the key.
    NotFound,
    /// The holder has the bytes but no route back to the requester.
    HolderUnreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    #[serde(rename_all = "camelCase")]
    FileInfo {
        file_id: FileKey,
        file_name: String,
        file_type: String,
        file_size: u64,
        original_sender: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    FileHeader {
        file_id: FileKey,
        file_name: String,
        file_type: String,
        file_size: u64,
        original_sender: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        file_id: FileKey,
        offset: u64,
        total: u64,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete { file_id: FileKey },
    #[serde(rename_all = "camelCase")]
    BlobRequest {
        file_id: FileKey,
        /// The requester.
        peer_id: PeerId,
        /// The holder, when the request is addressed to an intermediate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forward_to: Option<PeerId>,
    },
    #[serde(rename_all = "camelCase")]
    BlobRequestForwarded {
        file_id: FileKey,
        /// The original requester.
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    BlobError {
        file_id: FileKey,
        code: BlobErrorCode,
        message: String,
        /// Final recipient when the error travels through a relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionNotification { peer_id: PeerId, timestamp: u64 },
    KeepAlive { timestamp: u64 },
    KeepAliveResponse { timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    DisconnectNotification { peer_id: PeerId },
}

impl Message {
    pub fn file_info(meta: &FileMeta) -> Self {
        Self::FileInfo {
            file_id: meta.key.clone(),
            file_name: meta.name.clone(),
            file_type: meta.mime.clone(),
            file_size: meta.size,
            original_sender: meta.holder.clone(),
        }
    }

    pub fn file_header(meta: &FileMeta) -> Self {
        Self::FileHeader {
            file_id: meta.key.clone(),
            file_name: meta.name.clone(),
            file_type: meta.mime.clone(),
            file_size: meta.size,
            original_sender: meta.holder.clone(),
        }
    }

    /// Metadata carried by `file-info` and `file-header`.
    ///
    /// The key is recomputed from name and size. `None` when the frame is
    /// another kind or its `fileId` disagrees with the recomputed key.
    pub fn meta(&self) -> Option<FileMeta> {
        match self {
            Self::FileInfo {
                file_id,
                file_name,
                file_type,
                file_size,
                original_sender,
            }
            | Self::FileHeader {
                file_id,
                file_name,
                file_type,
                file_size,
                original_sender,
            } => {
                let meta = FileMeta::new(
                    file_name.as_str(),
                    file_type.as_str(),
                    *file_size,
                    original_sender.clone(),
                );
                (&meta.key == file_id).then_some(meta)
            }
            _ => None,
        }
    }

    /// Wire name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileInfo { .. } => "file-info",
            Self::FileHeader { .. } => "file-header",
            Self::FileChunk { .. } => "file-chunk",
            Self::FileComplete { .. } => "file-complete",
            Self::BlobRequest { .. } => "blob-request",
            Self::BlobRequestForwarded { .. } => "blob-request-forwarded",
            Self::BlobError { .. } => "blob-error",
            Self::ConnectionNotification { .. } => "connection-notification",
            Self::KeepAlive { .. } => "keep-alive",
            Self::KeepAliveResponse { .. } => "keep-alive-response",
            Self::DisconnectNotification { .. } => "disconnect-notification",
        }
    }

    pub fn encode(&self) -> MeshResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(frame: &[u8]) -> MeshResult<Self> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// Current Unix time in milliseconds.
pub fn now_unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
