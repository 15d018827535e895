use self::registry::SpindownRegistry;
use crate::SpindownToken;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod registry;
pub mod token;

/// A registry of background workloads that belong to one [`Scope`](crate::Scope)
/// and must be awaited when that scope is torn down.
///
/// Every background task of a worker [registers](Spindown::register) here and
/// holds on to the returned [`SpindownToken`]. When the worker closes, it first
/// cancels its scope and then [waits](Spindown::completed) for all tokens to be
/// punched out, within a bounded timeout.
///
/// The registry is cheaply cloneable; all clones share the same workloads.
#[derive(Clone)]
pub struct Spindown {
    registry: Arc<SpindownRegistry>,
}

/// Reports that some workloads did not punch out within the spindown timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "failed to spin down all workloads within the timeout: {spun_down} completed, {timed_out} timed out"
)]
pub struct SpindownTimeout {
    /// How many workloads completed in time.
    pub spun_down: usize,
    /// How many workloads were still running when the timeout elapsed.
    pub timed_out: usize,
}

impl Spindown {
    /// Creates an empty registry that waits at most `timeout` in
    /// [`completed`](Spindown::completed).
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: Arc::new(SpindownRegistry::new(timeout)),
        }
    }

    /// Registers a workload with the given human-readable name (needs not be
    /// unique). The workload punches out by calling
    /// [`punch_out`](SpindownToken::punch_out) or by dropping the token.
    pub fn register(&self, name: impl AsRef<str>) -> SpindownToken {
        self.registry.register(name.as_ref())
    }

    /// Waits for all registered workloads to punch out.
    ///
    /// Workloads registered while waiting are picked up in another cycle
    /// within the same overall timeout. Returns the number of workloads that
    /// completed. Does **not** signal the workloads to stop; that is the job of
    /// the owning [`Scope`](crate::Scope).
    pub async fn completed(&self) -> Result<usize, SpindownTimeout> {
        self.registry.spun_down().await
    }
}
