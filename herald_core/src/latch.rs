use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A barrier that is released exactly once, opening every linked [`Gate`].
///
/// Used for one-shot lifecycle signals: "all consumers are listening",
/// "the publisher is closed", and the like.
///
/// ```
/// use herald_core::Latch;
///
/// # tokio_test::block_on(async {
/// let started = Latch::new();
/// let gate = started.gate();
///
/// tokio::spawn(async move {
///     // ...declare queues, start consuming...
///     started.release();
/// });
///
/// gate.opened().await;
/// # })
/// ```
#[derive(Debug, Default, Clone)]
pub struct Latch {
    token: CancellationToken,
}

/// The waiting side of a [`Latch`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Gate {
    token: CancellationToken,
}

impl Latch {
    /// Returns a new, unreleased latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a gate linked to this latch.
    pub fn gate(&self) -> Gate {
        Gate {
            token: self.token.clone(),
        }
    }

    /// Releases this latch. Repeated calls have no additional effect.
    pub fn release(&self) {
        self.token.cancel();
    }

    /// Reports whether this latch has been released.
    pub fn is_released(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Gate {
    /// Waits until the linked latch is released.
    pub async fn opened(&self) {
        self.token.cancelled().await;
    }

    /// Waits until the linked latch is released, but no longer than
    /// `timeout`. Reports whether the gate opened in time.
    pub async fn opened_within(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.opened()).await.is_ok()
    }

    /// Reports whether the linked latch has been released.
    pub fn is_open(&self) -> bool {
        self.token.is_cancelled()
    }
}
