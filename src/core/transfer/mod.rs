//! Chunk transfer engine.
//!
//! [`sender::OutgoingTransfer`] turns one file into the ordered
//! `file-header`, `file-chunk`..., `file-complete` frame sequence for one
//! connection. [`receiver::Receiver`] rebuilds files from that sequence, one
//! session per (peer, file key).

pub mod receiver;
pub mod sender;

/// Whole-percent progress throttle.
///
/// `update` yields a value only when the integer percentage moves, so a
/// 10 MiB transfer reports at most 101 times regardless of chunk count.
#[derive(Debug, Default, Clone)]
pub struct ProgressGauge {
    last: Option<u8>,
}

impl ProgressGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, done: u64, total: u64) -> Option<u8> {
        let percent = percent(done, total);
        if self.last == Some(percent) {
            return None;
        }
        self.last = Some(percent);
        Some(percent)
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}
