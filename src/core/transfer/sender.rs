//! Sender side: one file streamed to one connection.

use crate::core::config::CHUNK_SIZE;
use crate::core::connection::{ChannelId, PeerId};
use crate::core::error::{MeshError, MeshResult};
use crate::core::library::FileMeta;
use crate::core::protocol::Message;
use crate::core::registry::Connection;
use bytes::Bytes;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Chunks { offset: u64 },
    Complete,
    Done,
}

/// Result of one [`OutgoingTransfer::pump`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// Budget exhausted, more frames remain.
    Pending,
    /// `file-complete` went out.
    Done,
}

/// Frame generator plus send cursor for one (file, peer) pair.
///
/// The transfer is pinned to the channel that was current when it started.
/// If the registry swaps that channel (reconnect) the transfer fails rather
/// than continuing mid-stream on a fresh channel whose far side has no
/// session.
#[derive(Debug)]
pub struct OutgoingTransfer {
    meta: FileMeta,
    content: Bytes,
    peer: PeerId,
    channel: Option<ChannelId>,
    stage: Stage,
    bytes_sent: u64,
}

impl OutgoingTransfer {
    pub fn new(meta: FileMeta, content: Bytes, peer: PeerId) -> Self {
        Self {
            meta,
            content,
            peer,
            channel: None,
            stage: Stage::Header,
            bytes_sent: 0,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Next frame in send order, advancing the cursor.
    pub fn next_frame(&mut self) -> Option<Message> {
        let size = self.content.len() as u64;
        match self.stage {
            Stage::Header => {
                self.stage = if size == 0 {
                    Stage::Complete
                } else {
                    Stage::Chunks { offset: 0 }
                };
                Some(Message::file_header(&self.meta))
            }
            Stage::Chunks { offset } => {
                let end = (offset + CHUNK_SIZE as u64).min(size);
                let data = self.content.slice(offset as usize..end as usize);
                self.bytes_sent = end;
                self.stage = if end == size {
                    Stage::Complete
                } else {
                    Stage::Chunks { offset: end }
                };
                Some(Message::FileChunk {
                    file_id: self.meta.key.clone(),
                    offset,
                    total: size,
                    data,
                })
            }
            Stage::Complete => {
                self.stage = Stage::Done;
                Some(Message::FileComplete {
                    file_id: self.meta.key.clone(),
                })
            }
            Stage::Done => None,
        }
    }

    /// Send up to `budget` frames over `conn`.
    ///
    /// The connection is checked before every frame; once it is no longer
    /// open, or its channel was replaced, the transfer fails with
    /// `ChannelClosed` and must be started again from scratch.
    pub fn pump(&mut self, conn: Option<&Connection>, budget: usize) -> MeshResult<PumpStatus> {
        let conn = conn.ok_or_else(|| self.closed())?;
        let channel = *self.channel.get_or_insert_with(|| conn.channel_id());

        for _ in 0..budget {
            if !conn.is_open() || conn.channel_id() != channel {
                warn!(
                    event = "transfer_channel_lost",
                    peer = %self.peer,
                    file = %self.meta.key,
                    sent = self.bytes_sent,
                );
                return Err(self.closed());
            }
            let Some(msg) = self.next_frame() else {
                return Ok(PumpStatus::Done);
            };
            debug!(event = "frame_out", peer = %self.peer, kind = msg.kind());
            conn.send(msg.encode()?).map_err(|e| {
                warn!(event = "transfer_send_failed", peer = %self.peer, file = %self.meta.key, %e);
                self.closed()
            })?;
            if self.is_done() {
                info!(
                    event = "transfer_sent",
                    peer = %self.peer,
                    file = %self.meta.key,
                    bytes = self.bytes_sent,
                );
                return Ok(PumpStatus::Done);
            }
        }
        Ok(PumpStatus::Pending)
    }

    fn closed(&self) -> MeshError {
        MeshError::ChannelClosed {
            peer: self.peer.clone(),
        }
    }
}
