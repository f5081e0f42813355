//! Liveness and recovery supervisor.
//!
//! Per-connection state machine:
//!
//! ```text
//! connecting ──open──▶ open ──channel dead──▶ degraded ──reopened──▶ open
//!                                                │
//!                                                └──attempt ceiling──▶ closed (removed)
//! ```
//!
//! A data channel can die without ever firing a close event, so the
//! supervisor does not rely on events alone: a periodic health sweep asks
//! every open channel whether it is still open. Keep-alives exist to make a
//! dead channel observable; their content is never interpreted.
//!
//! Only the side that dialed re-dials. The acceptor counts attempts on the
//! same schedule while waiting for the dialer to come back, so both sides
//! give up after the same number of rounds.

use crate::core::config::MeshConfig;
use crate::core::connection::{PeerId, Transport};
use crate::core::node::{UiEvent, UiSink};
use crate::core::protocol::{Message, now_unix_millis};
use crate::core::registry::{ConnectionRegistry, Health, HealthChange};
use crate::core::timers::{TimerId, TimerQueue};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    KeepAlive(PeerId),
    HealthSweep,
    Reconnect(PeerId),
    ConnectDeadline(PeerId),
}

/// Outcome of a reconnect timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Another attempt is scheduled.
    Retrying { attempt: u32 },
    /// Ceiling reached; the connection was removed.
    GaveUp,
    /// Nothing to do (entry gone, reopened, or the timer was superseded).
    Idle,
}

/// What the UI has been told about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seen {
    Connected,
    Recovering,
}

pub struct Liveness {
    config: MeshConfig,
    sweep: Option<TimerId>,
    seen: HashMap<PeerId, Seen>,
}

impl Liveness {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            sweep: None,
            seen: HashMap::new(),
        }
    }

    pub fn start(&mut self, timers: &mut TimerQueue<TimerKind>, now: Instant) {
        if self.sweep.is_none() {
            self.sweep = Some(timers.schedule(now + self.config.health_check_interval, TimerKind::HealthSweep));
        }
    }

    /// Bound the wait for a freshly dialed connection to open.
    pub fn arm_connect_deadline(
        &self,
        registry: &mut ConnectionRegistry,
        timers: &mut TimerQueue<TimerKind>,
        peer: &PeerId,
        now: Instant,
    ) {
        if let Some(conn) = registry.get_mut(peer) {
            let id = timers.schedule(now + self.config.connect_timeout, TimerKind::ConnectDeadline(peer.clone()));
            if let Some(old) = conn.connect_deadline.replace(id) {
                timers.cancel(old);
            }
        }
    }

    /// The connect deadline fired. Returns `true` if the connection never
    /// opened and was removed.
    pub fn connect_expired(
        &self,
        registry: &mut ConnectionRegistry,
        timers: &mut TimerQueue<TimerKind>,
        peer: &PeerId,
        id: TimerId,
    ) -> bool {
        let Some(conn) = registry.get_mut(peer) else {
            return false;
        };
        if conn.connect_deadline != Some(id) {
            return false;
        }
        conn.connect_deadline = None;
        if conn.health() != Health::Connecting {
            return false;
        }
        warn!(event = "connect_timeout", peer = %peer, timeout = ?self.config.connect_timeout);
        registry.remove(peer, timers);
        true
    }

    /// Channel reported open: mark the connection open and start its
    /// keep-alive schedule. Reconnect bookkeeping resets.
    pub fn on_open(
        &self,
        registry: &mut ConnectionRegistry,
        timers: &mut TimerQueue<TimerKind>,
        peer: &PeerId,
        now: Instant,
    ) -> bool {
        let Some(conn) = registry.get_mut(peer) else {
            return false;
        };
        conn.last_activity = now;
        conn.reconnect_attempts = 0;
        for id in [conn.connect_deadline.take(), conn.reconnect.take(), conn.keep_alive.take()]
            .into_iter()
            .flatten()
        {
            timers.cancel(id);
        }
        conn.keep_alive = Some(timers.schedule(
            now + self.config.keep_alive_interval,
            TimerKind::KeepAlive(peer.clone()),
        ));
        registry.set_health(peer, Health::Open)
    }

    /// Mark an open connection degraded and schedule its recovery.
    pub fn degrade(
        &self,
        registry: &mut ConnectionRegistry,
        timers: &mut TimerQueue<TimerKind>,
        peer: &PeerId,
        now: Instant,
    ) -> bool {
        let Some(conn) = registry.get_mut(peer) else {
            return false;
        };
        if conn.health() != Health::Open {
            return false;
        }
        if let Some(id) = conn.keep_alive.take() {
            timers.cancel(id);
        }
        if conn.reconnect.is_none() {
            let delay = self.retry_delay(conn.reconnect_attempts);
            conn.reconnect = Some(timers.schedule(now + delay, TimerKind::Reconnect(peer.clone())));
        }
        warn!(event = "connection_degraded", peer = %peer, dialer = conn.is_dialer());
        registry.set_health(peer, Health::Degraded)
    }

    /// Periodic sweep: degrade every open connection whose channel is no
    /// longer open, then reschedule.
    pub fn sweep(
        &mut self,
        registry: &mut ConnectionRegistry,
        timers: &mut TimerQueue<TimerKind>,
        now: Instant,
    ) -> Vec<PeerId> {
        self.sweep = Some(timers.schedule(now + self.config.health_check_interval, TimerKind::HealthSweep));
        self.check(registry, timers, now)
    }

    /// Health check without touching the sweep schedule.
    pub fn check(
        &self,
        registry: &mut ConnectionRegistry,
        timers: &mut TimerQueue<TimerKind>,
        now: Instant,
    ) -> Vec<PeerId> {
        let dead: Vec<PeerId> = registry
            .peers()
            .into_iter()
            .filter(|p| {
                registry
                    .get(p)
                    .is_some_and(|c| c.health() == Health::Open && !c.channel_is_open())
            })
            .collect();
        for peer in &dead {
            self.degrade(registry, timers, peer, now);
        }
        debug!(event = "health_check", peers = registry.len(), degraded = dead.len());
        dead
    }

    /// Keep-alive timer for one connection.
    pub fn keep_alive_due(
        &self,
        registry: &mut ConnectionRegistry,
        timers: &mut TimerQueue<TimerKind>,
        peer: &PeerId,
        id: TimerId,
        now: Instant,
    ) {
        let Some(conn) = registry.get_mut(peer) else {
            return;
        };
        if conn.keep_alive != Some(id) {
            return;
        }
        conn.keep_alive = None;
        if !conn.is_open() {
            return;
        }
        send_keep_alive(conn);
        conn.keep_alive = Some(timers.schedule(
            now + self.config.keep_alive_interval,
            TimerKind::KeepAlive(peer.clone()),
        ));
    }

    /// Foreground/background switch: check health immediately and probe
    /// every open connection without waiting for the next tick.
    pub fn burst(
        &self,
        registry: &mut ConnectionRegistry,
        timers: &mut TimerQueue<TimerKind>,
        now: Instant,
    ) -> Vec<PeerId> {
        let degraded = self.check(registry, timers, now);
        for peer in registry.open_peers() {
            if let Some(conn) = registry.get(&peer) {
                send_keep_alive(conn);
            }
        }
        degraded
    }

    /// Reconnect timer for one connection.
    pub fn reconnect_due(
        &self,
        registry: &mut ConnectionRegistry,
        timers: &mut TimerQueue<TimerKind>,
        transport: &dyn Transport,
        peer: &PeerId,
        id: TimerId,
        now: Instant,
    ) -> Recovery {
        let Some(conn) = registry.get_mut(peer) else {
            return Recovery::Idle;
        };
        if conn.reconnect != Some(id) {
            return Recovery::Idle;
        }
        conn.reconnect = None;
        if conn.health() == Health::Open {
            return Recovery::Idle;
        }
        if conn.reconnect_attempts >= self.config.reconnect_max_attempts {
            warn!(
                event = "reconnect_exhausted",
                peer = %peer,
                attempts = conn.reconnect_attempts,
            );
            registry.remove(peer, timers);
            return Recovery::GaveUp;
        }

        conn.reconnect_attempts += 1;
        let attempt = conn.reconnect_attempts;
        let dialer = conn.is_dialer();
        let delay = self.retry_delay(attempt);
        conn.reconnect = Some(timers.schedule(now + delay, TimerKind::Reconnect(peer.clone())));

        if dialer {
            match transport.connect(peer) {
                Ok(channel) => {
                    info!(event = "reconnect_attempt", peer = %peer, attempt, channel = %channel.id());
                    registry.reattach(peer, channel, now);
                }
                Err(e) => warn!(event = "reconnect_failed", peer = %peer, attempt, %e),
            }
        } else {
            debug!(event = "reconnect_wait", peer = %peer, attempt);
        }
        Recovery::Retrying { attempt }
    }

    /// Delay before attempt `n + 1`: the configured base, doubled per
    /// attempt already made.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        self.config.reconnect_delay.saturating_mul(1 << attempts.min(8))
    }

    /// Translate registry health transitions into peer-level UI events.
    /// `PeerDisconnected` fires once per loss, and only for peers the UI was
    /// told had connected.
    pub fn report(&mut self, changes: Vec<HealthChange>, ui: &UiSink) {
        for change in changes {
            let peer = change.peer;
            match change.to {
                Health::Open => match self.seen.insert(peer.clone(), Seen::Connected) {
                    Some(Seen::Recovering) => {
                        info!(event = "peer_reconnected", peer = %peer);
                        ui.notify(UiEvent::PeerReconnected(peer));
                    }
                    Some(Seen::Connected) => {}
                    None => {
                        info!(event = "peer_connected", peer = %peer);
                        ui.notify(UiEvent::PeerConnected(peer));
                    }
                },
                Health::Degraded | Health::Connecting => {
                    if let Some(seen) = self.seen.get_mut(&peer)
                        && *seen == Seen::Connected
                    {
                        *seen = Seen::Recovering;
                        if change.to == Health::Degraded {
                            ui.notify(UiEvent::PeerDegraded(peer));
                        }
                    }
                }
                Health::Closed => {
                    if self.seen.remove(&peer).is_some() {
                        info!(event = "peer_disconnected", peer = %peer);
                        ui.notify(UiEvent::PeerDisconnected(peer));
                    }
                }
            }
        }
    }
}

fn send_keep_alive(conn: &crate::core::registry::Connection) {
    let msg = Message::KeepAlive {
        timestamp: now_unix_millis(),
    };
    if let Err(e) = msg.encode().and_then(|frame| conn.send(frame)) {
        warn!(event = "keep_alive_failed", peer = %conn.peer(), %e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::sim::SimNetwork;

    struct Rig {
        net: SimNetwork,
        alice: crate::core::connection::sim::SimTransport,
        reg: ConnectionRegistry,
        timers: TimerQueue<TimerKind>,
        live: Liveness,
        t0: Instant,
    }

    fn rig() -> Rig {
        let net = SimNetwork::new();
        let (alice, _rx) = net.join("alice");
        let _ = net.join("bob");
        let mut rig = Rig {
            net,
            alice,
            reg: ConnectionRegistry::new(),
            timers: TimerQueue::new(),
            live: Liveness::new(MeshConfig::default()),
            t0: Instant::now(),
        };
        let bob = PeerId::from("bob");
        rig.reg.connect(&rig.alice, &bob, rig.t0).unwrap();
        rig.live.on_open(&mut rig.reg, &mut rig.timers, &bob, rig.t0);
        rig
    }

    #[test]
    fn sweep_degrades_silently_dead_channel() {
        let mut r = rig();
        let bob = PeerId::from("bob");
        assert!(r.live.check(&mut r.reg, &mut r.timers, r.t0).is_empty());

        r.net.drop_link(&PeerId::from("alice"), &bob);
        let dead = r.live.sweep(&mut r.reg, &mut r.timers, r.t0);
        assert_eq!(dead, vec![bob.clone()]);
        let conn = r.reg.get(&bob).unwrap();
        assert_eq!(conn.health(), Health::Degraded);
        assert!(conn.keep_alive.is_none());
        assert!(conn.reconnect.is_some());
    }

    #[test]
    fn retry_delay_doubles() {
        let live = Liveness::new(MeshConfig::default());
        let base = MeshConfig::default().reconnect_delay;
        assert_eq!(live.retry_delay(0), base);
        assert_eq!(live.retry_delay(1), base * 2);
        assert_eq!(live.retry_delay(2), base * 4);
    }

    #[test]
    fn report_fires_disconnect_once_and_only_after_connect() {
        let mut live = Liveness::new(MeshConfig::default());
        let (ui, mut rx) = UiSink::channel();
        let p = PeerId::from("p");
        let change = |from, to| HealthChange { peer: p.clone(), from, to };

        live.report(vec![change(Health::Closed, Health::Connecting), change(Health::Connecting, Health::Closed)], &ui);
        assert!(rx.try_recv().is_err());

        live.report(
            vec![
                change(Health::Closed, Health::Connecting),
                change(Health::Connecting, Health::Open),
                change(Health::Open, Health::Degraded),
                change(Health::Degraded, Health::Connecting),
                change(Health::Connecting, Health::Open),
                change(Health::Open, Health::Closed),
                change(Health::Closed, Health::Closed),
            ],
            &ui,
        );
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(
            events,
            vec![
                UiEvent::PeerConnected(p.clone()),
                UiEvent::PeerDegraded(p.clone()),
                UiEvent::PeerReconnected(p.clone()),
                UiEvent::PeerDisconnected(p.clone()),
            ]
        );
    }
}
