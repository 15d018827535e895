use crate::{SpindownTimeout, SpindownToken};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Thread-safe growable storage of [`Workload`]s.
pub(crate) struct SpindownRegistry {
    workloads: Mutex<Vec<Workload>>,
    timeout: Duration,
}

impl SpindownRegistry {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            workloads: Mutex::new(Vec::new()),
            timeout,
        }
    }

    pub(crate) fn register(&self, name: &str) -> SpindownToken {
        let workload = Workload::new(name);
        let token = SpindownToken::new(workload.token.clone());

        self.workloads.lock().push(workload);

        token
    }
}

impl SpindownRegistry {
    /// Repeatedly takes all registered workloads and waits for them, until no
    /// more workloads are registered or the shared deadline passes.
    pub(crate) async fn spun_down(&self) -> Result<usize, SpindownTimeout> {
        let deadline = Instant::now() + self.timeout;
        let mut count = 0usize;

        loop {
            let workloads = std::mem::take(&mut *self.workloads.lock());

            if workloads.is_empty() {
                debug!(count, "Spindown completed");
                return Ok(count);
            }

            count += workloads.len();
            debug!(
                pending = workloads.len(),
                "Waiting for registered workloads to complete",
            );

            if let Err(timed_out) = Self::spin_down_once(workloads, deadline).await {
                warn!("Some workloads did not complete gracefully");

                return Err(SpindownTimeout {
                    spun_down: count - timed_out,
                    timed_out,
                });
            }
        }
    }

    /// Waits for the given batch; on timeout returns how many are left.
    async fn spin_down_once(workloads: Vec<Workload>, deadline: Instant) -> Result<(), usize> {
        let mut pending = workloads
            .into_iter()
            .map(WorkloadFuture::from)
            .collect::<FuturesUnordered<_>>();

        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some(name)) => info!(workload = name.as_ref(), "Completed gracefully"),
                Ok(None) => return Ok(()),
                Err(_) => {
                    for future in pending.iter() {
                        error!(
                            workload = future.name.as_ref(),
                            "Did not complete in time during spindown",
                        );
                    }

                    return Err(pending.len());
                }
            }
        }
    }
}

/// A registered workload: a name for the logs and the token its owner cancels
/// when done.
struct Workload {
    name: Arc<str>,
    token: CancellationToken,
}

impl Workload {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            token: CancellationToken::new(),
        }
    }
}

/// Completes with the workload's name once its token is cancelled.
struct WorkloadFuture {
    name: Arc<str>,
    finished: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl From<Workload> for WorkloadFuture {
    fn from(workload: Workload) -> Self {
        let Workload { name, token } = workload;
        let finished = Box::pin(async move { token.cancelled().await });

        Self { name, finished }
    }
}

impl Future for WorkloadFuture {
    type Output = Arc<str>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.finished.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => Poll::Ready(self.name.clone()),
        }
    }
}
