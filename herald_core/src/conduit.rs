use std::time::Duration;
use tokio::select;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Request-response between one **owner task** holding a resource `T` and any
/// number of **requester tasks**.
///
/// The owner keeps the [`Conduit`] and repeatedly [listens](Conduit::requested)
/// for requests; requesters use linked [`Retriever`]s. Either side may go away
/// at any point: a requester then sees [`None`], an owner sees a failed send.
/// Neither case panics or logs.
///
/// ```
/// use herald_core::Conduit;
///
/// # tokio_test::block_on(async {
/// let conduit: Conduit<String> = Conduit::new();
/// let retriever = conduit.retriever();
///
/// let owner = tokio::spawn(async move {
///     if let Some(request) = conduit.requested().await {
///         let _ = request.send("channel".to_string());
///     }
/// });
///
/// assert_eq!(retriever.request().await.as_deref(), Some("channel"));
/// owner.await.unwrap();
/// # })
/// ```
#[derive(Debug)]
pub struct Conduit<T> {
    listener: AsyncMutex<mpsc::Receiver<oneshot::Sender<T>>>,
    requester_template: mpsc::Sender<oneshot::Sender<T>>,
}

/// Requests the resource `T` from the owner of the linked [`Conduit`].
///
/// Retrievers are light-weight and may be cloned freely.
#[derive(Debug, Clone)]
pub struct Retriever<T> {
    requester: mpsc::Sender<oneshot::Sender<T>>,
}

impl<T> Conduit<T> {
    /// Creates a new conduit with no pending requests.
    pub fn new() -> Self {
        // Requesters wait for the response right after sending, so there is
        // nothing to gain from a deeper buffer
        let (requester_template, listener) = mpsc::channel(1);

        Self {
            listener: AsyncMutex::new(listener),
            requester_template,
        }
    }

    /// Returns a new [`Retriever`] linked to this conduit.
    pub fn retriever(&self) -> Retriever<T> {
        Retriever {
            requester: self.requester_template.clone(),
        }
    }

    /// Waits for the next request and returns the one-off sender to answer it
    /// through.
    ///
    /// Returns [`None`] only if the request channel is closed, which cannot
    /// happen while this conduit holds its own sender; callers may still treat
    /// it as the end of service.
    pub async fn requested(&self) -> Option<oneshot::Sender<T>> {
        self.listener.lock().await.recv().await
    }
}

impl<T> Default for Conduit<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Retriever<T> {
    /// Requests the resource and waits for the answer. Returns [`None`] if the
    /// conduit is gone or the owner dropped the request unanswered.
    ///
    /// An owner that keeps the request without answering makes this wait
    /// indefinitely; see [`request_until`](Retriever::request_until) and
    /// [`request_with_timeout`](Retriever::request_with_timeout).
    pub async fn request(&self) -> Option<T> {
        let (sender, receiver) = oneshot::channel();

        if self.requester.send(sender).await.is_err() {
            return None;
        }

        receiver.await.ok()
    }

    /// Same as [`request`](Retriever::request), but gives up with [`None`] as
    /// soon as the given token is cancelled.
    pub async fn request_until(&self, token: &CancellationToken) -> Option<T> {
        select! {
            biased;
            _ = token.cancelled() => None,
            response = self.request() => response,
        }
    }

    /// Same as [`request`](Retriever::request), but gives up with [`None`]
    /// once the timeout elapses.
    pub async fn request_with_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.request())
            .await
            .ok()
            .flatten()
    }
}
