//! Receiver side: reassembly sessions.
//!
//! Chunks are appended in arrival order. The channel is ordered and
//! reliable, so offsets are logged but not used to reorder.

use super::ProgressGauge;
use crate::core::connection::PeerId;
use crate::core::error::{MeshError, MeshResult};
use crate::core::library::{FileKey, FileMeta};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// One in-flight inbound transfer.
#[derive(Debug)]
pub struct TransferSession {
    meta: FileMeta,
    chunks: Vec<Bytes>,
    received: u64,
    gauge: ProgressGauge,
}

impl TransferSession {
    fn new(meta: FileMeta) -> Self {
        Self {
            meta,
            chunks: Vec::new(),
            received: 0,
            gauge: ProgressGauge::new(),
        }
    }

    pub fn expected(&self) -> u64 {
        self.meta.size
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    fn assemble(self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks.into_iter().next().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(self.received as usize);
        for chunk in self.chunks {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

/// Whole-percent receive progress for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    pub file: FileKey,
    pub percent: u8,
}

/// A validated, reassembled file.
#[derive(Debug, Clone)]
pub struct Completed {
    pub meta: FileMeta,
    pub content: Bytes,
}

#[derive(Debug, Default)]
pub struct Receiver {
    sessions: HashMap<(PeerId, FileKey), TransferSession>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session, or restart an existing one for the same key from zero.
    pub fn on_header(&mut self, from: &PeerId, meta: FileMeta) {
        let key = (from.clone(), meta.key.clone());
        info!(event = "transfer_started", peer = %from, file = %meta.key, size = meta.size);
        if let Some(old) = self.sessions.insert(key, TransferSession::new(meta)) {
            warn!(
                event = "transfer_restarted",
                peer = %from,
                file = %old.meta.key,
                discarded = old.received,
            );
        }
    }

    /// Append a chunk. A chunk that would overshoot the declared size
    /// discards the session.
    pub fn on_chunk(
        &mut self,
        from: &PeerId,
        file: &FileKey,
        offset: u64,
        data: Bytes,
    ) -> MeshResult<Option<ChunkProgress>> {
        let id = (from.clone(), file.clone());
        let Some(session) = self.sessions.get_mut(&id) else {
            warn!(event = "chunk_without_session", peer = %from, file = %file, offset);
            return Ok(None);
        };
        if offset != session.received {
            debug!(event = "chunk_offset_skew", file = %file, offset, received = session.received);
        }

        let actual = session.received + data.len() as u64;
        if actual > session.expected() {
            let expected = session.expected();
            self.sessions.remove(&id);
            return Err(MeshError::SizeMismatch {
                file: file.clone(),
                expected,
                actual,
            });
        }

        session.received = actual;
        session.chunks.push(data);
        Ok(session
            .gauge
            .update(session.received, session.expected())
            .map(|percent| ChunkProgress {
                file: file.clone(),
                percent,
            }))
    }

    /// Validate and close a session. `Ok(None)` means there was no session.
    pub fn on_complete(&mut self, from: &PeerId, file: &FileKey) -> MeshResult<Option<Completed>> {
        let Some(session) = self.sessions.remove(&(from.clone(), file.clone())) else {
            warn!(event = "complete_without_session", peer = %from, file = %file);
            return Ok(None);
        };
        if session.received != session.expected() {
            return Err(MeshError::SizeMismatch {
                file: file.clone(),
                expected: session.expected(),
                actual: session.received,
            });
        }

        let meta = session.meta.clone();
        let content = session.assemble();
        info!(event = "transfer_received", peer = %from, file = %meta.key, bytes = content.len());
        Ok(Some(Completed { meta, content }))
    }

    /// Discard every partial session from `peer`. Returns the abandoned keys.
    pub fn abandon(&mut self, peer: &PeerId) -> Vec<FileKey> {
        let mut dropped = Vec::new();
        self.sessions.retain(|(from, key), session| {
            if from != peer {
                return true;
            }
            warn!(
                event = "transfer_abandoned",
                peer = %from,
                file = %key,
                received = session.received,
                expected = session.expected(),
            );
            dropped.push(key.clone());
            false
        });
        dropped
    }

    pub fn session(&self, from: &PeerId, file: &FileKey) -> Option<&TransferSession> {
        self.sessions.get(&(from.clone(), file.clone()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
