//! Send queue: one outbound file at a time.
//!
//! Entries are dispatched FIFO. The head entry is streamed to all of its
//! targets in the same rounds, interleaved chunk budget by chunk budget; the
//! next entry starts only after every target of the current one has either
//! finished or failed. A failure towards one target never stops the others.

use crate::core::connection::PeerId;
use crate::core::error::MeshError;
use crate::core::library::{Direction, FileKey, FileMeta};
use crate::core::node::{UiEvent, UiSink};
use crate::core::registry::ConnectionRegistry;
use crate::core::transfer::ProgressGauge;
use crate::core::transfer::sender::{OutgoingTransfer, PumpStatus};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Every connection open when the entry reaches the head of the queue.
    AllOpen,
    Peers(Vec<PeerId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// A file the local user shared.
    Share,
    /// Bytes streamed in answer to a blob request.
    Reply,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub meta: FileMeta,
    pub content: Bytes,
    pub targets: Targets,
    pub purpose: Purpose,
}

/// How a dispatched entry ended.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub file: FileKey,
    pub purpose: Purpose,
    pub delivered: Vec<PeerId>,
    pub failed: Vec<(PeerId, MeshError)>,
}

struct ActiveSend {
    meta: FileMeta,
    purpose: Purpose,
    transfers: Vec<OutgoingTransfer>,
    targets: u64,
    finished_bytes: u64,
    delivered: Vec<PeerId>,
    failed: Vec<(PeerId, MeshError)>,
    gauge: ProgressGauge,
}

impl ActiveSend {
    fn start(entry: QueueEntry, registry: &ConnectionRegistry) -> Self {
        let peers = match entry.targets {
            Targets::AllOpen => registry.open_peers(),
            Targets::Peers(peers) => peers,
        };
        info!(
            event = "send_dispatch",
            file = %entry.meta.key,
            targets = peers.len(),
            purpose = ?entry.purpose,
        );
        let transfers = peers
            .into_iter()
            .map(|peer| OutgoingTransfer::new(entry.meta.clone(), entry.content.clone(), peer))
            .collect::<Vec<_>>();
        Self {
            targets: transfers.len() as u64,
            meta: entry.meta,
            purpose: entry.purpose,
            transfers,
            finished_bytes: 0,
            delivered: Vec::new(),
            failed: Vec::new(),
            gauge: ProgressGauge::new(),
        }
    }

    fn round(&mut self, registry: &ConnectionRegistry, budget: usize) {
        let mut i = 0;
        while i < self.transfers.len() {
            let t = &mut self.transfers[i];
            let conn = registry.get(t.peer());
            match t.pump(conn, budget) {
                Ok(PumpStatus::Pending) => {
                    i += 1;
                    continue;
                }
                Ok(PumpStatus::Done) => {
                    self.finished_bytes += t.bytes_sent();
                    self.delivered.push(t.peer().clone());
                }
                Err(e) => {
                    warn!(event = "send_target_failed", peer = %t.peer(), file = %self.meta.key, %e);
                    self.failed.push((t.peer().clone(), e));
                }
            }
            self.transfers.swap_remove(i);
        }
    }

    fn sent_bytes(&self) -> u64 {
        self.finished_bytes + self.transfers.iter().map(|t| t.bytes_sent()).sum::<u64>()
    }
}

#[derive(Default)]
pub struct SendQueue {
    pending: VecDeque<QueueEntry>,
    active: Option<ActiveSend>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, entry: QueueEntry) {
        info!(event = "send_queued", file = %entry.meta.key, position = self.pending.len());
        self.pending.push_back(entry);
    }

    /// Entries waiting behind the one in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_work(&self) -> bool {
        self.active.is_some() || !self.pending.is_empty()
    }

    /// Run one round of the in-flight entry, starting the next entry first
    /// if none is in flight. Returns the outcome when an entry finishes.
    pub fn pump(
        &mut self,
        registry: &ConnectionRegistry,
        budget: usize,
        ui: &UiSink,
    ) -> Option<SendOutcome> {
        if self.active.is_none() {
            let entry = self.pending.pop_front()?;
            self.active = Some(ActiveSend::start(entry, registry));
        }
        let active = self.active.as_mut()?;
        active.round(registry, budget);

        let sent = active.sent_bytes();
        let total = active.meta.size * active.targets.max(1);
        if active.purpose == Purpose::Share
            && let Some(percent) = active.gauge.update(sent, total)
        {
            ui.notify(UiEvent::Progress {
                file: active.meta.key.clone(),
                percent,
                direction: Direction::Sent,
            });
        }

        if !active.transfers.is_empty() {
            return None;
        }
        let done = self.active.take()?;
        let outcome = SendOutcome {
            file: done.meta.key,
            purpose: done.purpose,
            delivered: done.delivered,
            failed: done.failed,
        };
        report(&outcome, done.targets, ui);
        Some(outcome)
    }
}

fn report(outcome: &SendOutcome, targets: u64, ui: &UiSink) {
    match outcome.purpose {
        Purpose::Share if outcome.delivered.is_empty() => {
            error!(event = "send_failed", file = %outcome.file, targets);
            ui.notify(UiEvent::Error(MeshError::AllRecipientsFailed {
                file: outcome.file.clone(),
            }));
        }
        Purpose::Share => {
            info!(
                event = "send_complete",
                file = %outcome.file,
                delivered = outcome.delivered.len(),
                failed = outcome.failed.len(),
            );
            ui.notify(UiEvent::SendComplete {
                file: outcome.file.clone(),
                delivered: outcome.delivered.len(),
            });
        }
        Purpose::Reply => {
            for (_, e) in &outcome.failed {
                ui.notify(UiEvent::Error(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CHUNK_SIZE;
    use crate::core::connection::sim::SimNetwork;
    use crate::core::registry::Health;
    use std::time::Instant;

    fn entry(name: &str, size: usize, targets: Targets) -> QueueEntry {
        QueueEntry {
            meta: FileMeta::new(name, "application/octet-stream", size as u64, PeerId::from("me")),
            content: Bytes::from(vec![7u8; size]),
            targets,
            purpose: Purpose::Share,
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn one_file_in_flight_at_a_time() {
        let net = SimNetwork::new();
        let (me, _me_rx) = net.join("me");
        let (_bob, _bob_rx) = net.join("bob");
        let mut reg = ConnectionRegistry::new();
        let bob = PeerId::from("bob");
        reg.connect(&me, &bob, Instant::now()).unwrap();
        reg.set_health(&bob, Health::Open);
        let (ui, _ui_rx) = UiSink::channel();

        let mut q = SendQueue::new();
        q.enqueue(entry("first", CHUNK_SIZE * 3, Targets::AllOpen));
        q.enqueue(entry("second", 10, Targets::AllOpen));

        assert!(q.pump(&reg, 1, &ui).is_none());
        assert_eq!(q.len(), 1);

        let mut outcomes = Vec::new();
        while q.has_work() {
            outcomes.extend(q.pump(&reg, 1, &ui));
        }
        let order: Vec<_> = outcomes.iter().map(|o| o.file.to_string()).collect();
        assert_eq!(order, ["first:49152", "second:10"]);
        assert!(outcomes.iter().all(|o| o.delivered == vec![bob.clone()]));
    }

    #[test]
    fn every_target_failing_is_reported_once() {
        let reg = ConnectionRegistry::new();
        let (ui, mut ui_rx) = UiSink::channel();
        let mut q = SendQueue::new();
        let targets = Targets::Peers(vec![PeerId::from("x"), PeerId::from("y")]);
        q.enqueue(entry("f", 3, targets));

        let outcome = q.pump(&reg, 4, &ui).unwrap();
        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.failed.len(), 2);
        let errors: Vec<_> = drain(&mut ui_rx)
            .into_iter()
            .filter(|e| matches!(e, UiEvent::Error(MeshError::AllRecipientsFailed { .. })))
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn target_lost_mid_transfer_is_recorded_while_others_finish() {
        let net = SimNetwork::new();
        let (me, _me_rx) = net.join("me");
        let (_bob, _bob_rx) = net.join("bob");
        let (_carol, _carol_rx) = net.join("carol");
        let mut reg = ConnectionRegistry::new();
        let (bob, carol) = (PeerId::from("bob"), PeerId::from("carol"));
        for p in [&bob, &carol] {
            reg.connect(&me, p, Instant::now()).unwrap();
            reg.set_health(p, Health::Open);
        }
        let (ui, mut ui_rx) = UiSink::channel();

        let mut q = SendQueue::new();
        q.enqueue(entry("f", CHUNK_SIZE * 3, Targets::AllOpen));
        assert!(q.pump(&reg, 2, &ui).is_none());
        net.drop_link(&PeerId::from("me"), &bob);

        let mut outcome = None;
        while q.has_work() {
            outcome = outcome.or(q.pump(&reg, 1, &ui));
        }
        let outcome = outcome.unwrap();
        assert_eq!(outcome.delivered, vec![carol]);
        assert_eq!(outcome.failed, vec![(bob.clone(), MeshError::ChannelClosed { peer: bob })]);
        assert!(
            drain(&mut ui_rx)
                .iter()
                .any(|e| matches!(e, UiEvent::SendComplete { delivered: 1, .. }))
        );
    }

    #[test]
    fn no_open_targets_is_all_recipients_failed() {
        let reg = ConnectionRegistry::new();
        let (ui, mut ui_rx) = UiSink::channel();
        let mut q = SendQueue::new();
        q.enqueue(entry("f", 3, Targets::AllOpen));

        let outcome = q.pump(&reg, 4, &ui).unwrap();
        assert!(outcome.delivered.is_empty() && outcome.failed.is_empty());
        let events = drain(&mut ui_rx);
        assert!(events.contains(&UiEvent::Error(MeshError::AllRecipientsFailed { file: outcome.file.clone() })));
        assert!(!events.iter().any(|e| matches!(e, UiEvent::SendComplete { .. })));
    }

    #[test]
    fn partial_failure_still_completes() {
        let net = SimNetwork::new();
        let (me, _me_rx) = net.join("me");
        let (_bob, _bob_rx) = net.join("bob");
        let mut reg = ConnectionRegistry::new();
        let bob = PeerId::from("bob");
        reg.connect(&me, &bob, Instant::now()).unwrap();
        reg.set_health(&bob, Health::Open);
        let (ui, mut ui_rx) = UiSink::channel();

        let mut q = SendQueue::new();
        q.enqueue(entry("f", 5, Targets::Peers(vec![bob.clone(), PeerId::from("ghost")])));
        let outcome = q.pump(&reg, 8, &ui).unwrap();
        assert_eq!(outcome.delivered, vec![bob]);
        assert_eq!(outcome.failed.len(), 1);
        assert!(
            drain(&mut ui_rx)
                .iter()
                .any(|e| matches!(e, UiEvent::SendComplete { delivered: 1, .. }))
        );
    }
}
