//! File identity, file records and the in-memory content store.
//!
//! Content lives only in memory for the lifetime of the process. The holder
//! of a record is fixed when the record is created and is never rewritten,
//! no matter how many hops the metadata travels.

use crate::core::connection::PeerId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Deterministic file identity derived from name and size.
///
/// Two distinct files sharing both name and size map to the same key; the
/// second one is treated as a duplicate of the first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileKey(String);

impl FileKey {
    pub fn derive(name: &str, size: u64) -> Self {
        Self(format!("{name}:{size}"))
    }
}

impl Display for FileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

/// Metadata every mesh member agrees on for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub key: FileKey,
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub holder: PeerId,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, size: u64, holder: PeerId) -> Self {
        let name = name.into();
        Self {
            key: FileKey::derive(&name, size),
            name,
            mime: mime.into(),
            size,
            holder,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub meta: FileMeta,
    pub direction: Direction,
    /// Peer the metadata arrived from; `None` for local files.
    pub learned_from: Option<PeerId>,
    content: Option<Bytes>,
}

impl FileRecord {
    pub fn new(meta: FileMeta, direction: Direction, learned_from: Option<PeerId>) -> Self {
        Self {
            meta,
            direction,
            learned_from,
            content: None,
        }
    }

    pub fn with_content(mut self, content: Bytes) -> Self {
        self.content = Some(content);
        self
    }

    pub fn key(&self) -> &FileKey {
        &self.meta.key
    }

    pub fn content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    pub fn summary(&self) -> FileSummary {
        FileSummary {
            key: self.meta.key.clone(),
            name: self.meta.name.clone(),
            mime: self.meta.mime.clone(),
            size: self.meta.size,
            holder: self.meta.holder.clone(),
            direction: self.direction,
            available: self.content.is_some(),
        }
    }
}

/// UI-facing snapshot of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub key: FileKey,
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub holder: PeerId,
    pub direction: Direction,
    pub available: bool,
}

/// Sent and received history plus the content store, keyed by file key.
#[derive(Debug, Default)]
pub struct FileLibrary {
    records: HashMap<FileKey, FileRecord>,
    order: Vec<FileKey>,
}

impl FileLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &FileKey) -> Option<&FileRecord> {
        self.records.get(key)
    }

    /// Record a file. Returns `false` and leaves the library untouched when
    /// the key is already known in either direction.
    pub fn insert(&mut self, record: FileRecord) -> bool {
        let key = record.key().clone();
        if self.records.contains_key(&key) {
            return false;
        }
        self.records.insert(key.clone(), record);
        self.order.push(key);
        true
    }

    /// Attach reassembled bytes to an existing record. Bytes whose length
    /// differs from the recorded size are refused.
    pub fn attach_content(&mut self, key: &FileKey, content: Bytes) -> bool {
        match self.records.get_mut(key) {
            Some(record) if content.len() as u64 == record.meta.size => {
                record.content = Some(content);
                true
            }
            _ => false,
        }
    }

    pub fn content(&self, key: &FileKey) -> Option<Bytes> {
        self.records.get(key).and_then(|r| r.content.clone())
    }

    /// Drop cached bytes, keeping the metadata.
    pub fn evict(&mut self, key: &FileKey) -> bool {
        self.records
            .get_mut(key)
            .and_then(|r| r.content.take())
            .is_some()
    }

    /// Records in the order they were first learned.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.order.iter().filter_map(|k| self.records.get(k))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

}
