use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Cooperative stop flag shared between a task and its owner.
///
/// The flag is sticky: a request made before the task starts is observed on its first
/// wait.
#[derive(Clone, Debug)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Sleep for `period` or until stop is requested. Returns `true` if stopped.
    pub async fn sleep(&self, period: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => self.is_requested(),
            _ = rx.wait_for(|stopped| *stopped) => true,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
