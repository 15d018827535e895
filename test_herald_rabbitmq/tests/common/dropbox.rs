use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Collects whatever handlers and callbacks hand to it, and lets a test wait
/// until enough has arrived.
#[derive(Clone, Default)]
pub struct Dropbox {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    items: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
}

impl Dropbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, item: impl Into<Vec<u8>>) {
        self.inner.items.lock().push(item.into());
        self.inner.notify.notify_waiters();
    }

    pub fn count(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn items(&self) -> Vec<Vec<u8>> {
        self.inner.items.lock().clone()
    }

    /// Waits until at least `n` items arrived. Reports whether they did
    /// within the timeout.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.notify.notified();

            if self.count() >= n {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() >= n;
            }
        }
    }
}
