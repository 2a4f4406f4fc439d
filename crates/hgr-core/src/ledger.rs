use hgr_types::Limits;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Node capacity accounting.
///
/// Reservations are added and released under a lock. Every release also
/// posts a non-blocking wakeup on a capacity-1 channel; several releases
/// before the waiter drains it collapse into one wakeup, so waiters must
/// re-read [`ResourceLedger::available`] rather than count notifications.
pub struct ResourceLedger {
    limit: Limits,
    current: Mutex<Limits>,
    released_tx: mpsc::Sender<()>,
    released_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl ResourceLedger {
    pub fn new(limit: Limits) -> Self {
        let (released_tx, released_rx) = mpsc::channel(1);
        Self {
            limit,
            current: Mutex::new(Limits::default()),
            released_tx,
            released_rx: tokio::sync::Mutex::new(released_rx),
        }
    }

    pub fn limit(&self) -> Limits {
        self.limit
    }

    /// Add `limits` to the reservation and return the new total.
    pub fn reserve(&self, limits: Limits) -> Limits {
        let mut current = self.current.lock();
        *current = current.saturating_add(limits);
        debug!(reserved = %limits, total = %*current, "Resources reserved");
        *current
    }

    /// Subtract `limits` from the reservation, wake a waiter, and return the
    /// new total.
    pub fn release(&self, limits: Limits) -> Limits {
        let snapshot = {
            let mut current = self.current.lock();
            *current = current.saturating_sub(limits);
            *current
        };
        // Full means a wakeup is already pending.
        let _ = self.released_tx.try_send(());
        debug!(released = %limits, total = %snapshot, "Resources released");
        snapshot
    }

    /// Currently reserved resources.
    pub fn snapshot(&self) -> Limits {
        *self.current.lock()
    }

    /// Capacity not yet reserved.
    pub fn available(&self) -> Limits {
        self.limit.saturating_sub(self.snapshot())
    }

    /// Wait until some release happens after the last drained wakeup.
    pub async fn released(&self) {
        let mut rx = self.released_rx.lock().await;
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.recv().await;
    }
}
