//! Mesh metadata propagation.
//!
//! A file introduced by one peer reaches peers it never connected to by
//! being re-announced hop by hop as `file-info`. Two rules keep this from
//! turning into a storm:
//!
//! - a key already in the library is never recorded or forwarded again;
//! - a re-announcement never goes back to the peer it came from.
//!
//! Forwarding carries metadata only. The holder named in the announcement is
//! copied verbatim, so every peer in the mesh asks the original holder for
//! the bytes, never the relaying hub.

use crate::core::connection::PeerId;
use crate::core::error::{MeshError, MeshResult};
use crate::core::library::{Direction, FileLibrary, FileMeta, FileRecord};
use crate::core::node::{UiEvent, UiSink};
use crate::core::protocol::Message;
use crate::core::registry::{Connection, ConnectionRegistry};
use bytes::Bytes;
use tracing::{debug, info, warn};

/// What [`learn`] did with incoming metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    /// First sighting: recorded and re-announced.
    Recorded,
    /// Already known; the delivered bytes were attached to the record.
    ContentAttached,
    /// Already known; nothing changed.
    Known,
}

/// Record metadata learned from `source` and forward it through the mesh.
pub fn learn(
    local: &PeerId,
    library: &mut FileLibrary,
    registry: &ConnectionRegistry,
    meta: FileMeta,
    source: &PeerId,
    content: Option<Bytes>,
    ui: &UiSink,
) -> Learned {
    let content = content.filter(|c| {
        let fits = c.len() as u64 == meta.size;
        if !fits {
            warn!(event = "content_size_mismatch", file = %meta.key, declared = meta.size, bytes = c.len());
        }
        fits
    });
    if let Some(existing) = library.get(&meta.key) {
        let Some(content) = content.filter(|_| existing.content().is_none()) else {
            debug!(event = "metadata_duplicate", file = %meta.key, from = %source);
            return Learned::Known;
        };
        if !library.attach_content(&meta.key, content) {
            return Learned::Known;
        }
        if let Some(record) = library.get(&meta.key) {
            ui.notify(UiEvent::FileListUpdated(record.summary()));
        }
        return Learned::ContentAttached;
    }

    let direction = if &meta.holder == local {
        Direction::Sent
    } else {
        Direction::Received
    };
    let mut record = FileRecord::new(meta.clone(), direction, Some(source.clone()));
    if let Some(content) = content {
        record = record.with_content(content);
    }
    ui.notify(UiEvent::FileListUpdated(record.summary()));
    library.insert(record);
    info!(event = "metadata_recorded", file = %meta.key, holder = %meta.holder, from = %source);

    let forwarded = announce(registry, &meta, Some(source));
    if forwarded > 0 {
        debug!(event = "metadata_forwarded", file = %meta.key, peers = forwarded);
    }
    Learned::Recorded
}

/// Record a file selected locally for sending. This peer is its holder.
///
/// Sharing a key this peer already holds again restores evicted bytes. A key
/// already recorded under another holder is refused: this peer could not
/// serve requests for it.
pub fn record_local(
    library: &mut FileLibrary,
    meta: FileMeta,
    content: Bytes,
    ui: &UiSink,
) -> MeshResult<()> {
    if let Some(existing) = library.get(&meta.key) {
        if existing.meta.holder != meta.holder {
            return Err(MeshError::KeyCollision {
                file: meta.key,
                holder: existing.meta.holder.clone(),
            });
        }
        if existing.content().is_some() || !library.attach_content(&meta.key, content) {
            debug!(event = "local_file_duplicate", file = %meta.key);
            return Ok(());
        }
        info!(event = "local_content_restored", file = %meta.key);
        if let Some(record) = library.get(&meta.key) {
            ui.notify(UiEvent::FileListUpdated(record.summary()));
        }
        return Ok(());
    }
    let record = FileRecord::new(meta, Direction::Sent, None).with_content(content);
    ui.notify(UiEvent::FileListUpdated(record.summary()));
    library.insert(record);
    Ok(())
}

/// Send `file-info` for `meta` to every open peer except `except`.
/// Returns the number of peers reached.
pub fn announce(registry: &ConnectionRegistry, meta: &FileMeta, except: Option<&PeerId>) -> usize {
    let frame = match Message::file_info(meta).encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(event = "announce_encode_failed", file = %meta.key, %e);
            return 0;
        }
    };
    let mut reached = 0;
    for peer in registry.open_peers() {
        if Some(&peer) == except {
            continue;
        }
        let Some(conn) = registry.get(&peer) else {
            continue;
        };
        match conn.send(frame.clone()) {
            Ok(()) => reached += 1,
            Err(e) => warn!(event = "announce_failed", peer = %peer, file = %meta.key, %e),
        }
    }
    reached
}

/// Announce the whole library to a freshly opened connection so a late
/// joiner learns the files already circulating. Records that came from, or
/// are held by, that peer are skipped.
pub fn sync_library(library: &FileLibrary, conn: &Connection) -> usize {
    let peer = conn.peer();
    let mut sent = 0;
    for record in library.records() {
        if &record.meta.holder == peer || record.learned_from.as_ref() == Some(peer) {
            continue;
        }
        let result = Message::file_info(&record.meta)
            .encode()
            .and_then(|frame| conn.send(frame));
        match result {
            Ok(()) => sent += 1,
            Err(e) => {
                warn!(event = "library_sync_failed", peer = %peer, file = %record.meta.key, %e);
                break;
            }
        }
    }
    if sent > 0 {
        debug!(event = "library_synced", peer = %peer, files = sent);
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::sim::SimNetwork;
    use crate::core::connection::TransportEvent;
    use crate::core::registry::Health;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn frames(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let TransportEvent::Data { frame, .. } = ev {
                out.push(Message::decode(&frame).unwrap());
            }
        }
        out
    }

    #[test]
    fn hub_forwards_to_everyone_but_the_source() {
        let net = SimNetwork::new();
        let (hub, _hub_rx) = net.join("hub");
        let (_a, mut a_rx) = net.join("a");
        let (_c, mut c_rx) = net.join("c");
        let mut reg = ConnectionRegistry::new();
        let now = Instant::now();
        for p in ["a", "c"] {
            reg.connect(&hub, &PeerId::from(p), now).unwrap();
            reg.set_health(&PeerId::from(p), Health::Open);
        }
        frames(&mut a_rx);
        frames(&mut c_rx);

        let (ui, mut ui_rx) = UiSink::channel();
        let mut lib = FileLibrary::new();
        let meta = FileMeta::new("pic.png", "image/png", 42, PeerId::from("a"));
        let hub_id = PeerId::from("hub");
        let a = PeerId::from("a");

        assert_eq!(learn(&hub_id, &mut lib, &reg, meta.clone(), &a, None, &ui), Learned::Recorded);
        assert!(frames(&mut a_rx).is_empty());
        let to_c = frames(&mut c_rx);
        assert_eq!(to_c, vec![Message::file_info(&meta)]);
        assert!(matches!(ui_rx.try_recv(), Ok(UiEvent::FileListUpdated(s)) if s.holder == a));

        assert_eq!(learn(&hub_id, &mut lib, &reg, meta, &a, None, &ui), Learned::Known);
        assert!(frames(&mut c_rx).is_empty());
        assert!(ui_rx.try_recv().is_err());
        assert_eq!(lib.len(), 1);
    }

    #[test]
    fn late_content_attaches_without_forwarding() {
        let reg = ConnectionRegistry::new();
        let (ui, _ui_rx) = UiSink::channel();
        let mut lib = FileLibrary::new();
        let me = PeerId::from("me");
        let src = PeerId::from("src");
        let meta = FileMeta::new("a.txt", "text/plain", 2, src.clone());

        learn(&me, &mut lib, &reg, meta.clone(), &src, None, &ui);
        let outcome = learn(&me, &mut lib, &reg, meta.clone(), &src, Some(Bytes::from_static(b"hi")), &ui);
        assert_eq!(outcome, Learned::ContentAttached);
        assert_eq!(lib.content(&meta.key).unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(lib.get(&meta.key).unwrap().direction, Direction::Received);
    }

    #[test]
    fn content_longer_than_declared_is_not_attached() {
        let reg = ConnectionRegistry::new();
        let (ui, _ui_rx) = UiSink::channel();
        let mut lib = FileLibrary::new();
        let me = PeerId::from("me");
        let src = PeerId::from("src");
        let meta = FileMeta::new("a.txt", "text/plain", 2, src.clone());

        learn(&me, &mut lib, &reg, meta.clone(), &src, None, &ui);
        let outcome = learn(&me, &mut lib, &reg, meta.clone(), &src, Some(Bytes::from_static(b"toolong")), &ui);
        assert_eq!(outcome, Learned::Known);
        assert!(lib.content(&meta.key).is_none());
    }

    #[test]
    fn sharing_a_key_held_elsewhere_is_refused() {
        let (ui, _ui_rx) = UiSink::channel();
        let mut lib = FileLibrary::new();
        let other = PeerId::from("other");
        let theirs = FileMeta::new("a.txt", "text/plain", 2, other.clone());
        lib.insert(FileRecord::new(theirs, Direction::Received, Some(other.clone())));

        let mine = FileMeta::new("a.txt", "text/plain", 2, PeerId::from("me"));
        let err = record_local(&mut lib, mine.clone(), Bytes::from_static(b"hi"), &ui).unwrap_err();
        assert_eq!(err, MeshError::KeyCollision { file: mine.key.clone(), holder: other.clone() });
        assert_eq!(lib.get(&mine.key).unwrap().meta.holder, other);
        assert!(lib.content(&mine.key).is_none());
    }

    #[test]
    fn resharing_own_file_restores_evicted_bytes() {
        let (ui, mut ui_rx) = UiSink::channel();
        let mut lib = FileLibrary::new();
        let meta = FileMeta::new("a.txt", "text/plain", 2, PeerId::from("me"));
        record_local(&mut lib, meta.clone(), Bytes::from_static(b"hi"), &ui).unwrap();
        assert!(lib.evict(&meta.key));

        record_local(&mut lib, meta.clone(), Bytes::from_static(b"hi"), &ui).unwrap();
        assert_eq!(lib.content(&meta.key).unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(lib.len(), 1);
        let updates = std::iter::from_fn(|| ui_rx.try_recv().ok()).count();
        assert_eq!(updates, 2);
    }

    #[test]
    fn own_file_echoed_back_is_recorded_as_sent() {
        let reg = ConnectionRegistry::new();
        let (ui, _ui_rx) = UiSink::channel();
        let mut lib = FileLibrary::new();
        let me = PeerId::from("me");
        let meta = FileMeta::new("mine.txt", "text/plain", 1, me.clone());
        learn(&me, &mut lib, &reg, meta.clone(), &PeerId::from("other"), None, &ui);
        assert_eq!(lib.get(&meta.key).unwrap().direction, Direction::Sent);
    }
}
