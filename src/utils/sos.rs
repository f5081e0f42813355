//! Signal-of-Stop: shutdown token shared by the node loop and the CLI.
//!
//! Clones share one flag. Cancelling any clone wakes every pending
//! [`SignalOfStop::wait`], including waits that start afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    inner: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    stopping: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.stopping.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn cancelled(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Resolve once the signal is cancelled.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not lost.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_every_clone() {
        let sos = SignalOfStop::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let s = sos.clone();
                tokio::spawn(async move { s.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;
        sos.cancel();
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn wait_after_cancel_returns_immediately() {
        let sos = SignalOfStop::new();
        sos.cancel();
        sos.cancel();
        assert!(sos.cancelled());
        tokio::time::timeout(Duration::from_millis(100), sos.wait())
            .await
            .unwrap();
    }
}
