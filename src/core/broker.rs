//! Blob retrieval broker.
//!
//! Metadata travels the whole mesh but bytes stay with their holder until
//! someone asks. A download resolves, in order, to:
//!
//! 1. the local cache,
//! 2. a `blob-request` on an open connection to the holder,
//! 3. a fresh connection to the holder, with the request parked until it opens,
//! 4. a `blob-request` relayed through the peer the metadata came from, when
//!    the transport cannot even start a connection to the holder.
//!
//! On the serving side a request is answered from cache when possible,
//! relayed to the holder as `blob-request-forwarded` otherwise, and refused
//! with `blob-error` when neither works. The holder streams forwarded replies
//! straight to the requester and only if it already has a connection to it;
//! without one the request fails closed with `holder-unreachable`, which the
//! relay passes back.

use crate::core::connection::PeerId;
use crate::core::error::{MeshError, MeshResult};
use crate::core::library::{FileKey, FileLibrary, FileMeta};
use crate::core::protocol::{BlobErrorCode, Message};
use crate::core::registry::ConnectionRegistry;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Where a download will be satisfied from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local(Bytes),
    /// Open connection to the holder.
    Direct(PeerId),
    /// A connection to the holder exists but is not open yet.
    AwaitOpen(PeerId),
    /// No connection to the holder; dial it.
    Dial(PeerId),
}

/// Decide how to satisfy a download of `key`.
pub fn route(
    local: &PeerId,
    library: &FileLibrary,
    registry: &ConnectionRegistry,
    key: &FileKey,
) -> MeshResult<Route> {
    let record = library
        .get(key)
        .ok_or_else(|| MeshError::UnknownFile { file: key.clone() })?;
    if let Some(content) = record.content() {
        return Ok(Route::Local(content.clone()));
    }
    let holder = record.meta.holder.clone();
    if &holder == local {
        return Err(MeshError::BlobUnavailable {
            file: key.clone(),
            reason: "content is no longer held in memory".into(),
        });
    }
    Ok(match registry.get(&holder) {
        Some(conn) if conn.is_open() => Route::Direct(holder),
        Some(_) => Route::AwaitOpen(holder),
        None => Route::Dial(holder),
    })
}

/// A reply transfer the node must queue: stream `meta` to `to`.
#[derive(Debug, Clone)]
pub struct Serve {
    pub meta: FileMeta,
    pub content: Bytes,
    pub to: PeerId,
}

/// Retrieval state owned by the node.
#[derive(Debug, Default)]
pub struct Broker {
    /// Downloads requested by the local user and not yet delivered.
    wanted: HashSet<FileKey>,
    /// Requests waiting for a connection to their holder to open.
    parked: HashMap<PeerId, Vec<FileKey>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn want(&mut self, key: &FileKey) {
        self.wanted.insert(key.clone());
    }

    /// `true` if `key` was wanted; the want is cleared either way.
    pub fn take_wanted(&mut self, key: &FileKey) -> bool {
        self.wanted.remove(key)
    }

    pub fn park(&mut self, holder: &PeerId, key: &FileKey) {
        let keys = self.parked.entry(holder.clone()).or_default();
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }

    /// Send every request parked on `holder`, now that its connection is open.
    pub fn flush_parked(&mut self, local: &PeerId, registry: &ConnectionRegistry, holder: &PeerId) {
        for key in self.parked.remove(holder).unwrap_or_default() {
            if let Err(e) = request(local, registry, holder, &key, None) {
                warn!(event = "parked_request_failed", holder = %holder, file = %key, %e);
            }
        }
    }

    /// Drop requests parked on `holder` and return the wanted keys among them.
    pub fn fail_parked(&mut self, holder: &PeerId) -> Vec<FileKey> {
        self.parked
            .remove(holder)
            .unwrap_or_default()
            .into_iter()
            .filter(|k| self.wanted.remove(k))
            .collect()
    }

    /// Handle `blob-error`. Errors addressed to another peer are passed on;
    /// errors for this peer are returned for the UI.
    pub fn on_error(
        &mut self,
        local: &PeerId,
        library: &FileLibrary,
        registry: &ConnectionRegistry,
        from: &PeerId,
        msg: &Message,
    ) -> Option<MeshError> {
        let Message::BlobError {
            file_id,
            code,
            message,
            peer_id,
        } = msg
        else {
            return None;
        };
        if let Some(target) = peer_id.as_ref().filter(|p| *p != local) {
            match send(registry, target, msg) {
                Ok(()) => debug!(event = "blob_error_relayed", file = %file_id, to = %target),
                Err(e) => warn!(event = "blob_error_unroutable", file = %file_id, to = %target, %e),
            }
            return None;
        }

        self.wanted.remove(file_id);
        warn!(event = "blob_error", file = %file_id, from = %from, ?code, reason = %message);
        Some(match code {
            BlobErrorCode::HolderUnreachable => MeshError::HolderUnreachable {
                file: file_id.clone(),
                holder: library
                    .get(file_id)
                    .map(|r| r.meta.holder.clone())
                    .unwrap_or_else(|| from.clone()),
            },
            BlobErrorCode::NotFound => MeshError::BlobUnavailable {
                file: file_id.clone(),
                reason: message.clone(),
            },
        })
    }
}

/// Handle `blob-request` from `from` on behalf of `requester`.
pub fn on_request(
    local: &PeerId,
    library: &FileLibrary,
    registry: &ConnectionRegistry,
    from: &PeerId,
    key: &FileKey,
    requester: &PeerId,
    forward_to: Option<&PeerId>,
) -> Option<Serve> {
    let record = library.get(key);
    if let Some(record) = record
        && let Some(content) = record.content()
    {
        if !reachable(registry, requester) {
            refuse(
                registry,
                from,
                key,
                BlobErrorCode::HolderUnreachable,
                "no connection to the requester",
                reply_target(from, requester),
            );
            return None;
        }
        info!(event = "blob_request_served", file = %key, requester = %requester, via = %from);
        return Some(Serve {
            meta: record.meta.clone(),
            content: content.clone(),
            to: requester.clone(),
        });
    }

    let holder = forward_to
        .cloned()
        .or_else(|| record.map(|r| r.meta.holder.clone()))
        .filter(|h| h != local && h != from);
    let Some(holder) = holder else {
        refuse(
            registry,
            from,
            key,
            BlobErrorCode::NotFound,
            "content not found",
            reply_target(from, requester),
        );
        return None;
    };

    let forwarded = Message::BlobRequestForwarded {
        file_id: key.clone(),
        peer_id: requester.clone(),
    };
    match send(registry, &holder, &forwarded) {
        Ok(()) => {
            info!(event = "blob_request_relayed", file = %key, requester = %requester, holder = %holder)
        }
        Err(e) => {
            warn!(event = "blob_relay_failed", file = %key, holder = %holder, %e);
            refuse(
                registry,
                from,
                key,
                BlobErrorCode::HolderUnreachable,
                "relay has no open connection to the holder",
                reply_target(from, requester),
            );
        }
    }
    None
}

/// Handle `blob-request-forwarded` relayed by `relay` for `requester`.
pub fn on_forwarded(
    library: &FileLibrary,
    registry: &ConnectionRegistry,
    relay: &PeerId,
    key: &FileKey,
    requester: &PeerId,
) -> Option<Serve> {
    let Some((meta, content)) = library
        .get(key)
        .and_then(|r| r.content().map(|c| (r.meta.clone(), c.clone())))
    else {
        refuse(registry, relay, key, BlobErrorCode::NotFound, "content not found", Some(requester));
        return None;
    };
    if !reachable(registry, requester) {
        warn!(event = "forwarded_request_unroutable", file = %key, requester = %requester, relay = %relay);
        refuse(
            registry,
            relay,
            key,
            BlobErrorCode::HolderUnreachable,
            "holder has no connection to the requester",
            Some(requester),
        );
        return None;
    }
    info!(event = "forwarded_request_served", file = %key, requester = %requester, relay = %relay);
    Some(Serve {
        meta,
        content,
        to: requester.clone(),
    })
}

/// Send a `blob-request` for `key` to `to`. With `forward_to` set, `to` is a
/// relay that should pass the request on to that holder.
pub fn request(
    local: &PeerId,
    registry: &ConnectionRegistry,
    to: &PeerId,
    key: &FileKey,
    forward_to: Option<&PeerId>,
) -> MeshResult<()> {
    let msg = Message::BlobRequest {
        file_id: key.clone(),
        peer_id: local.clone(),
        forward_to: forward_to.cloned(),
    };
    send(registry, to, &msg)?;
    info!(event = "blob_requested", file = %key, to = %to, forward_to = ?forward_to);
    Ok(())
}

/// Relay candidate for `key`: the open peer the metadata was learned from,
/// provided it is not the holder itself.
pub fn relay_for(library: &FileLibrary, registry: &ConnectionRegistry, key: &FileKey) -> Option<PeerId> {
    let record = library.get(key)?;
    record
        .learned_from
        .clone()
        .filter(|p| p != &record.meta.holder && reachable(registry, p))
}

fn reachable(registry: &ConnectionRegistry, peer: &PeerId) -> bool {
    registry.get(peer).is_some_and(|c| c.is_open())
}

fn send(registry: &ConnectionRegistry, to: &PeerId, msg: &Message) -> MeshResult<()> {
    let conn = registry
        .get(to)
        .filter(|c| c.is_open())
        .ok_or_else(|| MeshError::ChannelClosed { peer: to.clone() })?;
    conn.send(msg.encode()?)
}

/// A relayed request's error must name the requester so the relay can pass
/// it on; a direct request's error needs no address.
fn reply_target<'a>(from: &PeerId, requester: &'a PeerId) -> Option<&'a PeerId> {
    (from != requester).then_some(requester)
}

fn refuse(
    registry: &ConnectionRegistry,
    to: &PeerId,
    key: &FileKey,
    code: BlobErrorCode,
    reason: &str,
    recipient: Option<&PeerId>,
) {
    let msg = Message::BlobError {
        file_id: key.clone(),
        code,
        message: reason.to_string(),
        peer_id: recipient.cloned(),
    };
    match send(registry, to, &msg) {
        Ok(()) => debug!(event = "blob_error_sent", file = %key, to = %to, ?code),
        Err(e) => warn!(event = "blob_error_send_failed", file = %key, to = %to, %e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::library::{Direction, FileRecord};

    fn lib_with(meta: &FileMeta, content: Option<&'static [u8]>, learned_from: Option<&str>) -> FileLibrary {
        let mut lib = FileLibrary::new();
        let mut record = FileRecord::new(meta.clone(), Direction::Received, learned_from.map(PeerId::from));
        if let Some(c) = content {
            record = record.with_content(Bytes::from_static(c));
        }
        lib.insert(record);
        lib
    }

    #[test]
    fn route_prefers_local_cache() {
        let meta = FileMeta::new("a", "text/plain", 2, PeerId::from("far"));
        let lib = lib_with(&meta, Some(b"hi"), Some("hub"));
        let reg = ConnectionRegistry::new();
        assert_eq!(
            route(&PeerId::from("me"), &lib, &reg, &meta.key).unwrap(),
            Route::Local(Bytes::from_static(b"hi"))
        );
    }

    #[test]
    fn route_dials_unconnected_holder() {
        let meta = FileMeta::new("a", "text/plain", 2, PeerId::from("far"));
        let lib = lib_with(&meta, None, Some("hub"));
        let reg = ConnectionRegistry::new();
        assert_eq!(
            route(&PeerId::from("me"), &lib, &reg, &meta.key).unwrap(),
            Route::Dial(PeerId::from("far"))
        );
    }

    #[test]
    fn route_rejects_unknown_and_evicted_own_files() {
        let me = PeerId::from("me");
        let reg = ConnectionRegistry::new();
        let lib = FileLibrary::new();
        assert!(matches!(
            route(&me, &lib, &reg, &FileKey::from("x:1")),
            Err(MeshError::UnknownFile { .. })
        ));

        let mine = FileMeta::new("mine", "text/plain", 1, me.clone());
        let lib = lib_with(&mine, None, None);
        assert!(matches!(
            route(&me, &lib, &reg, &mine.key),
            Err(MeshError::BlobUnavailable { .. })
        ));
    }

    #[test]
    fn parked_requests_fail_only_wanted_keys() {
        let mut broker = Broker::new();
        let holder = PeerId::from("h");
        let (a, b) = (FileKey::from("a:1"), FileKey::from("b:1"));
        broker.want(&a);
        broker.park(&holder, &a);
        broker.park(&holder, &a);
        broker.park(&holder, &b);
        assert_eq!(broker.fail_parked(&holder), vec![a.clone()]);
        assert!(!broker.take_wanted(&a));
        assert!(broker.fail_parked(&holder).is_empty());
    }

    #[test]
    fn reply_target_only_names_relayed_requesters() {
        let (a, b) = (PeerId::from("a"), PeerId::from("b"));
        assert_eq!(reply_target(&a, &a), None);
        assert_eq!(reply_target(&a, &b), Some(&b));
    }
}
