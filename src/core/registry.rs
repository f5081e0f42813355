//! Connection registry: exactly one [`Connection`] per remote peer.
//!
//! The registry owns every channel. Other components look connections up by
//! [`PeerId`] and never keep them. Health transitions are queued as
//! [`HealthChange`]s which the liveness supervisor drains after each event.

use crate::core::connection::{Channel, ChannelId, PeerId, Transport};
use crate::core::error::{MeshError, MeshResult};
use crate::core::timers::{TimerId, TimerQueue};
use bytes::Bytes;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Connecting,
    Open,
    Degraded,
    Closed,
}

/// Observable health transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthChange {
    pub peer: PeerId,
    pub from: Health,
    pub to: Health,
}

pub struct Connection {
    peer: PeerId,
    channel: Arc<dyn Channel>,
    health: Health,
    /// We dialed this peer; only the dialer re-dials after a drop.
    dialer: bool,
    pub last_activity: Instant,
    pub reconnect_attempts: u32,
    pub keep_alive: Option<TimerId>,
    pub reconnect: Option<TimerId>,
    pub connect_deadline: Option<TimerId>,
}

impl Connection {
    fn new(channel: Arc<dyn Channel>, dialer: bool, now: Instant) -> Self {
        Self {
            peer: channel.peer().clone(),
            channel,
            health: Health::Connecting,
            dialer,
            last_activity: now,
            reconnect_attempts: 0,
            keep_alive: None,
            reconnect: None,
            connect_deadline: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn is_dialer(&self) -> bool {
        self.dialer
    }

    /// Registered as open and the channel agrees.
    pub fn is_open(&self) -> bool {
        self.health == Health::Open && self.channel.is_open()
    }

    pub fn channel_is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn send(&self, frame: Bytes) -> MeshResult<()> {
        self.channel.send(frame).map_err(MeshError::from)
    }

    fn cancel_timers<K>(&mut self, timers: &mut TimerQueue<K>) {
        for id in [
            self.keep_alive.take(),
            self.reconnect.take(),
            self.connect_deadline.take(),
        ]
        .into_iter()
        .flatten()
        {
            timers.cancel(id);
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<PeerId, Connection>,
    changes: Vec<HealthChange>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dial `peer`. Fails with `AlreadyConnected` while any entry for it
    /// exists; replacing one requires [`remove`](Self::remove) first.
    pub fn connect(
        &mut self,
        transport: &dyn Transport,
        peer: &PeerId,
        now: Instant,
    ) -> MeshResult<&mut Connection> {
        if self.connections.contains_key(peer) {
            return Err(MeshError::AlreadyConnected { peer: peer.clone() });
        }
        let channel = transport.connect(peer)?;
        debug!(event = "dial", peer = %peer, channel = %channel.id());
        Ok(self.insert(Connection::new(channel, true, now)))
    }

    /// Register a channel opened by a remote peer.
    ///
    /// An entry whose channel is dead (degraded, or not yet noticed by the
    /// health sweep) is treated as that peer coming back: the new channel
    /// replaces the old one and the entry keeps its reconnect bookkeeping.
    /// An entry with a live channel rejects the newcomer.
    pub fn on_incoming(
        &mut self,
        channel: Arc<dyn Channel>,
        now: Instant,
    ) -> MeshResult<&mut Connection> {
        let peer = channel.peer().clone();
        match self.connections.entry(peer.clone()) {
            Entry::Vacant(slot) => {
                info!(event = "incoming_connection", peer = %peer, channel = %channel.id());
                self.changes.push(HealthChange {
                    peer,
                    from: Health::Closed,
                    to: Health::Connecting,
                });
                Ok(slot.insert(Connection::new(channel, false, now)))
            }
            Entry::Occupied(slot) => {
                let conn = slot.into_mut();
                match conn.health {
                    Health::Connecting | Health::Open if conn.channel.is_open() => {
                        channel.close();
                        Err(MeshError::AlreadyConnected { peer })
                    }
                    _ => {
                        info!(event = "incoming_reconnect", peer = %peer, channel = %channel.id());
                        self.changes.push(swap_channel(conn, channel, now));
                        Ok(conn)
                    }
                }
            }
        }
    }

    /// Swap the channel of an existing entry, closing the old one first.
    pub fn reattach(&mut self, peer: &PeerId, channel: Arc<dyn Channel>, now: Instant) -> bool {
        let Some(conn) = self.connections.get_mut(peer) else {
            return false;
        };
        self.changes.push(swap_channel(conn, channel, now));
        true
    }

    pub fn get(&self, peer: &PeerId) -> Option<&Connection> {
        self.connections.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut Connection> {
        self.connections.get_mut(peer)
    }

    /// Look a connection up only if `channel` is still its current channel.
    pub fn current(&mut self, peer: &PeerId, channel: ChannelId) -> Option<&mut Connection> {
        self.connections
            .get_mut(peer)
            .filter(|c| c.channel.id() == channel)
    }

    /// Drop the entry, cancel its timers and close its channel.
    pub fn remove<K>(&mut self, peer: &PeerId, timers: &mut TimerQueue<K>) -> Option<Connection> {
        let mut conn = self.connections.remove(peer)?;
        conn.cancel_timers(timers);
        conn.channel.close();
        let from = conn.health;
        conn.health = Health::Closed;
        self.record(peer, from, Health::Closed);
        info!(event = "connection_removed", peer = %peer);
        Some(conn)
    }

    pub fn set_health(&mut self, peer: &PeerId, health: Health) -> bool {
        let Some(conn) = self.connections.get_mut(peer) else {
            return false;
        };
        let from = conn.health;
        if from == health {
            return false;
        }
        conn.health = health;
        self.record(peer, from, health);
        true
    }

    /// Peers whose connection is open, in stable order.
    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.is_open())
            .map(|c| c.peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.connections.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn drain_changes(&mut self) -> Vec<HealthChange> {
        std::mem::take(&mut self.changes)
    }

    fn insert(&mut self, conn: Connection) -> &mut Connection {
        let peer = conn.peer.clone();
        self.record(&peer, Health::Closed, Health::Connecting);
        self.connections.entry(peer).or_insert(conn)
    }

    fn record(&mut self, peer: &PeerId, from: Health, to: Health) {
        self.changes.push(HealthChange {
            peer: peer.clone(),
            from,
            to,
        });
    }
}

fn swap_channel(conn: &mut Connection, channel: Arc<dyn Channel>, now: Instant) -> HealthChange {
    conn.channel.close();
    conn.channel = channel;
    conn.last_activity = now;
    let from = conn.health;
    conn.health = Health::Connecting;
    HealthChange {
        peer: conn.peer.clone(),
        from,
        to: Health::Connecting,
    }
}
