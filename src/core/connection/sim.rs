//! Deterministic in-process transport.
//!
//! Peers join a [`SimNetwork`] and get a [`SimTransport`] plus the receiving
//! end of their event queue. Channels are ordered and reliable; delivery is
//! immediate (an event is queued on the remote side during `send`). Failure
//! modes are injected explicitly:
//!
//! - [`SimNetwork::drop_link`] kills every channel between two peers without
//!   emitting any close event, the way a silently dead data channel behaves.
//! - [`SimNetwork::set_reachable`] makes new connects to a peer hang in the
//!   connecting state forever.
//! - [`SimNetwork::partition`] makes connects between two peers fail up front
//!   with `Unreachable`, while both stay reachable for everyone else.

use super::{Channel, ChannelId, PeerId, Transport, TransportError, TransportEvent};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

type EventTx = mpsc::UnboundedSender<TransportEvent>;

struct End {
    peer: PeerId,
    channel: ChannelId,
    events: EventTx,
}

struct Link {
    open: AtomicBool,
    closed: AtomicBool,
    ends: [End; 2],
}

impl Link {
    fn connects(&self, a: &PeerId, b: &PeerId) -> bool {
        (&self.ends[0].peer == a && &self.ends[1].peer == b)
            || (&self.ends[0].peer == b && &self.ends[1].peer == a)
    }
}

struct PeerSlot {
    events: EventTx,
    reachable: bool,
}

#[derive(Default)]
struct NetState {
    peers: HashMap<PeerId, PeerSlot>,
    links: Vec<Arc<Link>>,
    partitions: HashSet<(PeerId, PeerId)>,
}

impl NetState {
    fn partitioned(&self, a: &PeerId, b: &PeerId) -> bool {
        self.partitions.contains(&(a.clone(), b.clone()))
            || self.partitions.contains(&(b.clone(), a.clone()))
    }
}

/// Shared simulated network. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<NetState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a peer and return its transport and event queue.
    pub fn join(
        &self,
        id: impl Into<PeerId>,
    ) -> (SimTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().peers.insert(
            id.clone(),
            PeerSlot {
                events: tx.clone(),
                reachable: true,
            },
        );
        (
            SimTransport {
                id,
                events: tx,
                net: self.clone(),
            },
            rx,
        )
    }

    /// Connects to an unreachable peer stay in the connecting state forever.
    pub fn set_reachable(&self, peer: &PeerId, reachable: bool) {
        if let Some(slot) = self.lock().peers.get_mut(peer) {
            slot.reachable = reachable;
        }
    }

    /// Silently kill every channel between `a` and `b`. No events are emitted.
    pub fn drop_link(&self, a: &PeerId, b: &PeerId) {
        for link in self.lock().links.iter().filter(|l| l.connects(a, b)) {
            link.open.store(false, Ordering::Release);
        }
    }

    /// Refuse every future connect between `a` and `b`.
    pub fn partition(&self, a: &PeerId, b: &PeerId) {
        self.lock().partitions.insert((a.clone(), b.clone()));
    }
}

/// One peer's handle on the simulated network.
pub struct SimTransport {
    id: PeerId,
    events: EventTx,
    net: SimNetwork,
}

impl Transport for SimTransport {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    fn connect(&self, peer: &PeerId) -> Result<Arc<dyn Channel>, TransportError> {
        let mut state = self.net.lock();
        if state.partitioned(&self.id, peer) {
            return Err(TransportError::Unreachable(peer.clone()));
        }
        let (remote_events, reachable) = match state.peers.get(peer) {
            Some(slot) => (slot.events.clone(), slot.reachable),
            None => return Err(TransportError::Unreachable(peer.clone())),
        };

        let link = Arc::new(Link {
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ends: [
                End {
                    peer: self.id.clone(),
                    channel: ChannelId::next(),
                    events: self.events.clone(),
                },
                End {
                    peer: peer.clone(),
                    channel: ChannelId::next(),
                    events: remote_events,
                },
            ],
        });
        state.links.push(link.clone());
        drop(state);

        let local: Arc<dyn Channel> = Arc::new(SimChannel {
            link: link.clone(),
            side: 0,
        });

        if reachable {
            link.open.store(true, Ordering::Release);
            let remote: Arc<dyn Channel> = Arc::new(SimChannel {
                link: link.clone(),
                side: 1,
            });
            let [near, far] = &link.ends;
            let _ = far.events.send(TransportEvent::Incoming(remote));
            let _ = far.events.send(TransportEvent::Open {
                peer: near.peer.clone(),
                channel: far.channel,
            });
            let _ = near.events.send(TransportEvent::Open {
                peer: far.peer.clone(),
                channel: near.channel,
            });
        }
        Ok(local)
    }
}

/// One half of a simulated link.
pub struct SimChannel {
    link: Arc<Link>,
    side: usize,
}

impl SimChannel {
    fn near(&self) -> &End {
        &self.link.ends[self.side]
    }

    fn far(&self) -> &End {
        &self.link.ends[1 - self.side]
    }
}

impl Channel for SimChannel {
    fn peer(&self) -> &PeerId {
        &self.far().peer
    }

    fn id(&self) -> ChannelId {
        self.near().channel
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::Acquire)
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        trace!(event = "sim_send", from = %self.near().peer, to = %self.far().peer, bytes = frame.len());
        self.far()
            .events
            .send(TransportEvent::Data {
                peer: self.near().peer.clone(),
                channel: self.far().channel,
                frame,
            })
            .map_err(|_| TransportError::Closed("remote queue gone".into()))
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.open.store(false, Ordering::Release);
        let near = self.near();
        let far = self.far();
        let _ = near.events.send(TransportEvent::Closed {
            peer: far.peer.clone(),
            channel: near.channel,
        });
        let _ = far.events.send(TransportEvent::Closed {
            peer: near.peer.clone(),
            channel: far.channel,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn connect_delivers_incoming_and_open_to_both_sides() {
        let net = SimNetwork::new();
        let (a, mut a_rx) = net.join("alice");
        let (_b, mut b_rx) = net.join("bob");

        let ch = a.connect(&PeerId::from("bob")).unwrap();
        assert!(ch.is_open());
        assert_eq!(ch.peer(), &PeerId::from("bob"));

        let a_events = drain(&mut a_rx);
        assert!(matches!(&a_events[..], [TransportEvent::Open { peer, .. }] if peer == &PeerId::from("bob")));

        let b_events = drain(&mut b_rx);
        assert_eq!(b_events.len(), 2);
        assert!(matches!(&b_events[0], TransportEvent::Incoming(c) if c.peer() == &PeerId::from("alice")));
        assert!(matches!(&b_events[1], TransportEvent::Open { .. }));
    }

    #[test]
    fn frames_arrive_in_order() {
        let net = SimNetwork::new();
        let (a, _a_rx) = net.join("alice");
        let (_b, mut b_rx) = net.join("bob");
        let ch = a.connect(&PeerId::from("bob")).unwrap();
        drain(&mut b_rx);

        for i in 0..10u8 {
            ch.send(Bytes::from(vec![i])).unwrap();
        }
        let frames: Vec<u8> = drain(&mut b_rx)
            .into_iter()
            .filter_map(|ev| match ev {
                TransportEvent::Data { frame, .. } => Some(frame[0]),
                _ => None,
            })
            .collect();
        assert_eq!(frames, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn dropped_link_is_silent() {
        let net = SimNetwork::new();
        let (a, mut a_rx) = net.join("alice");
        let (_b, mut b_rx) = net.join("bob");
        let ch = a.connect(&PeerId::from("bob")).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        net.drop_link(&PeerId::from("alice"), &PeerId::from("bob"));
        assert!(!ch.is_open());
        assert_eq!(ch.send(Bytes::from_static(b"x")), Err(TransportError::NotOpen));
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
    }

    #[test]
    fn unreachable_peer_never_opens() {
        let net = SimNetwork::new();
        let (a, mut a_rx) = net.join("alice");
        let (_b, mut b_rx) = net.join("bob");
        net.set_reachable(&PeerId::from("bob"), false);

        let ch = a.connect(&PeerId::from("bob")).unwrap();
        assert!(!ch.is_open());
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());

        assert!(matches!(
            a.connect(&PeerId::from("nobody")),
            Err(TransportError::Unreachable(_))
        ));
    }

    #[test]
    fn partition_refuses_only_that_pair() {
        let net = SimNetwork::new();
        let (a, _a_rx) = net.join("alice");
        let (_b, _b_rx) = net.join("bob");
        let (c, _c_rx) = net.join("carol");
        net.partition(&PeerId::from("bob"), &PeerId::from("alice"));

        assert!(matches!(
            a.connect(&PeerId::from("bob")),
            Err(TransportError::Unreachable(p)) if p == PeerId::from("bob")
        ));
        assert!(c.connect(&PeerId::from("bob")).unwrap().is_open());
    }
}
