//! Deterministic multi-node harness over the simulated transport.
//!
//! Nodes are driven by hand: [`SimMesh::settle`] feeds every queued
//! transport event, fires due timers and pumps outbound sends, round-robin
//! over all nodes, until nothing is left to do. Time only moves through
//! [`SimMesh::advance`], so liveness scenarios need no sleeps.

use crate::core::config::MeshConfig;
use crate::core::connection::sim::SimNetwork;
use crate::core::connection::{PeerId, TransportEvent};
use crate::core::node::{MeshNode, NodeCommand, UiEvent, UiSink};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const MAX_ROUNDS: usize = 100_000;

/// Initialise a tracing subscriber for tests.
///
/// Respects `RUST_LOG`, defaults to `warn`. Safe to call more than once.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub struct SimPeer {
    pub node: MeshNode,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    ui: mpsc::UnboundedReceiver<UiEvent>,
    /// Every UI event observed so far, in order.
    pub seen: Vec<UiEvent>,
}

pub struct SimMesh {
    pub net: SimNetwork,
    pub now: Instant,
    peers: BTreeMap<PeerId, SimPeer>,
}

impl SimMesh {
    pub fn new() -> Self {
        init_test_tracing();
        Self {
            net: SimNetwork::new(),
            now: Instant::now(),
            peers: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, name: &str) -> PeerId {
        self.add_with(name, MeshConfig::default())
    }

    pub fn add_with(&mut self, name: &str, config: MeshConfig) -> PeerId {
        let (transport, events) = self.net.join(name);
        let (ui, ui_rx) = UiSink::channel();
        let mut node = MeshNode::new(Arc::new(transport), config, ui);
        node.start(self.now);
        let id = node.local_id().clone();
        self.peers.insert(
            id.clone(),
            SimPeer {
                node,
                events,
                ui: ui_rx,
                seen: Vec::new(),
            },
        );
        id
    }

    pub fn peer(&mut self, id: &PeerId) -> &mut SimPeer {
        self.peers
            .get_mut(id)
            .unwrap_or_else(|| panic!("unknown sim peer {id}"))
    }

    pub fn node(&mut self, id: &PeerId) -> &mut MeshNode {
        &mut self.peer(id).node
    }

    /// Issue a UI command and settle.
    pub fn command(&mut self, id: &PeerId, cmd: NodeCommand) {
        let now = self.now;
        self.node(id).handle_command(cmd, now);
        self.settle();
    }

    /// Dial `b` from `a` and settle.
    pub fn link(&mut self, a: &PeerId, b: &PeerId) {
        self.command(a, NodeCommand::Connect(b.clone()));
    }

    /// Run every node until no events, due timers or outbound work remain.
    pub fn settle(&mut self) {
        let now = self.now;
        for _ in 0..MAX_ROUNDS {
            let mut busy = false;
            for peer in self.peers.values_mut() {
                while let Ok(event) = peer.events.try_recv() {
                    peer.node.handle_transport(event, now);
                    busy = true;
                }
                if peer.node.next_deadline().is_some_and(|at| at <= now) {
                    peer.node.fire_timers(now);
                    busy = true;
                }
                if peer.node.has_outbound_work() {
                    peer.node.pump();
                    busy = true;
                }
                while let Ok(ev) = peer.ui.try_recv() {
                    peer.seen.push(ev);
                }
            }
            if !busy {
                return;
            }
        }
        panic!("sim mesh did not settle");
    }

    /// Move the clock forward in `step`s, settling after each.
    pub fn advance(&mut self, total: Duration, step: Duration) {
        let end = self.now + total;
        while self.now < end {
            self.now = (self.now + step).min(end);
            self.settle();
        }
    }

    /// UI events of `id` observed so far.
    pub fn seen(&mut self, id: &PeerId) -> &[UiEvent] {
        &self.peer(id).seen
    }
}
