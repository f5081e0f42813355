//! Cancellable deadline queue.
//!
//! The node never sleeps inside a handler. Anything that has to happen later
//! (keep-alive probes, health sweeps, reconnect attempts, connect deadlines)
//! is scheduled here, and the event loop sleeps until [`TimerQueue::next_deadline`].
//! Cancelling is a map removal, so dropping a connection and its timers
//! happens in the same step.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
pub struct TimerQueue<K> {
    deadlines: BTreeMap<(Instant, u64), K>,
    pending: HashMap<u64, Instant>,
    next_id: u64,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self {
            deadlines: BTreeMap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, kind: K) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.deadlines.insert((at, id), kind);
        self.pending.insert(id, at);
        TimerId(id)
    }

    /// Returns `false` when the timer already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.pending.remove(&id.0) {
            Some(at) => self.deadlines.remove(&(at, id.0)).is_some(),
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(at, _)| *at)
    }

    /// Pop the earliest timer due at or before `now`.
    ///
    /// One at a time, so a handler may schedule or cancel timers before the
    /// next one is taken.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, K)> {
        let (&(at, id), _) = self.deadlines.iter().next()?;
        if at > now {
            return None;
        }
        self.pending.remove(&id);
        self.deadlines.remove(&(at, id)).map(|k| (TimerId(id), k))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
