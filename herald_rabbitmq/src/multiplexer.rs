use crate::{Delivery, Publishable};
use async_trait::async_trait;
use futures::FutureExt;
use herald_core::CorrelationId;
use herald_telemetry::ReleaseMetrics;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{Instrument, debug, info_span, warn};

/// The error a [`Handler`] reports for a delivery it could not process.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Called for every message that is dropped: with the message type, the body
/// and the reason.
pub type DropCallback = Arc<dyn Fn(&str, &[u8], &str) + Send + Sync>;

/// Processes deliveries of one message type.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes the delivery. An error requeues a first delivery and drops a
    /// redelivered one.
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// A [`Handler`] made from an async closure over the message body.
pub struct FnHandler<F> {
    function: F,
}

/// Wraps an async closure over the message body into a [`Handler`].
pub fn handler_fn<F, Fut>(function: F) -> FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { function }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.function)(delivery.body().to_vec()).await
    }
}

/// A [`Handler`] that unmarshals the body into `P` before calling an async
/// closure. A body that fails to unmarshal counts as a handler error.
pub struct TypedHandler<P, F> {
    function: F,
    _message: PhantomData<fn() -> P>,
}

/// Wraps an async closure over a [`Publishable`] message into a [`Handler`].
pub fn typed_handler<P, F, Fut>(function: F) -> TypedHandler<P, F>
where
    P: Publishable + 'static,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    TypedHandler {
        function,
        _message: PhantomData,
    }
}

#[async_trait]
impl<P, F, Fut> Handler for TypedHandler<P, F>
where
    P: Publishable + 'static,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let message = P::unmarshal(delivery.body())?;

        (self.function)(message).await
    }
}

/// The table of [`Handler`]s, keyed by message type.
#[derive(Clone, Default)]
pub struct Handlers {
    table: HashMap<String, Arc<dyn Handler>>,
}

impl Handlers {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recreates this table with the given handler registered for the given
    /// message type, replacing any previous one.
    pub fn with(mut self, kind: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.insert(kind, handler);
        self
    }

    /// Registers the given handler for the given message type, replacing any
    /// previous one.
    pub fn insert(&mut self, kind: impl Into<String>, handler: impl Handler + 'static) {
        self.table.insert(kind.into(), Arc::new(handler));
    }

    /// Looks up the handler of the given message type.
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn Handler>> {
        self.table.get(kind)
    }

    /// Reports how many message types have a handler.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Reports whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// What the [`Multiplexer`] did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler succeeded; the delivery was acknowledged.
    Acked,
    /// No handler is registered for the type; the delivery was dropped.
    Unhandled,
    /// The handler failed on a first delivery; the delivery was requeued.
    Requeued,
    /// The handler failed on a redelivery; the delivery was dropped.
    Dropped,
}

impl DispatchOutcome {
    /// The short name of this outcome, as used in metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Unhandled => "unhandled",
            Self::Requeued => "requeued",
            Self::Dropped => "dropped",
        }
    }
}

/// Why a handler did not process a delivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Handler(HandlerError),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Routes deliveries to the [`Handler`] registered for their type and
/// settles them according to the outcome.
#[derive(Clone)]
pub struct Multiplexer {
    handlers: Handlers,
    on_drop: Option<DropCallback>,
    metrics: Option<ReleaseMetrics>,
}

impl Multiplexer {
    /// Creates a multiplexer over the given handler table.
    pub fn new(handlers: Handlers) -> Self {
        Self {
            handlers,
            on_drop: None,
            metrics: None,
        }
    }

    /// Recreates this multiplexer with the given drop callback.
    pub fn with_on_drop(self, on_drop: DropCallback) -> Self {
        Self {
            on_drop: Some(on_drop),
            ..self
        }
    }

    /// Recreates this multiplexer with the given metrics, counting every
    /// settled delivery by type and outcome.
    pub fn with_metrics(self, metrics: ReleaseMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..self
        }
    }

    /// Handles and settles one delivery. Never panics because of a handler.
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let outcome = self.settle(delivery).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_delivery(delivery.kind(), outcome.as_str());
        }

        outcome
    }

    async fn settle(&self, delivery: &Delivery) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(delivery.kind()) else {
            warn!(
                kind = delivery.kind(),
                exchange = delivery.exchange(),
                routing_key = delivery.routing_key(),
                message_id = delivery.message_id(),
                "Dropping a RabbitMQ message without a handler",
            );
            self.report_drop(delivery, "no handler");
            delivery.nack(false).await;
            return DispatchOutcome::Unhandled;
        };

        let result = self.run(handler.as_ref(), delivery).await;

        match result {
            Ok(()) => {
                delivery.ack().await;
                DispatchOutcome::Acked
            }
            Err(error) if !delivery.redelivered() => {
                warn!(
                    kind = delivery.kind(),
                    message_id = delivery.message_id(),
                    ?error,
                    error_message = %error,
                    "Requeueing a RabbitMQ message after a handler failure",
                );
                delivery.nack(true).await;
                DispatchOutcome::Requeued
            }
            Err(error) => {
                warn!(
                    alert = true,
                    kind = delivery.kind(),
                    message_id = delivery.message_id(),
                    ?error,
                    error_message = %error,
                    "Dropping a redelivered RabbitMQ message after a handler failure",
                );
                self.report_drop(delivery, &error.to_string());
                delivery.nack(false).await;
                DispatchOutcome::Dropped
            }
        }
    }

    async fn run(&self, handler: &dyn Handler, delivery: &Delivery) -> Result<(), DispatchError> {
        let span = info_span!(
            "dispatch",
            kind = delivery.kind(),
            exchange = delivery.exchange(),
            routing_key = delivery.routing_key(),
            message_id = delivery.message_id(),
            correlation_id = delivery.correlation_id(),
        );
        let correlation_id = CorrelationId::new(delivery.correlation_id());
        let started = Instant::now();

        let outcome = correlation_id
            .scope(AssertUnwindSafe(handler.handle(delivery)).catch_unwind())
            .instrument(span.clone())
            .await;

        span.in_scope(|| {
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Handled a RabbitMQ message",
            )
        });

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(DispatchError::Handler(error)),
            Err(payload) => Err(DispatchError::Panicked(panic_message(payload))),
        }
    }

    fn report_drop(&self, delivery: &Delivery, reason: &str) {
        if let Some(on_drop) = &self.on_drop {
            on_drop(delivery.kind(), delivery.body(), reason);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }

    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }

    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::{RecordingFinalizer, Settlement};
    use crate::{DecodeError, EncodeError, from_json, to_json};
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    type Drops = Arc<SyncMutex<Vec<(String, String)>>>;

    fn multiplexer(handlers: Handlers) -> (Multiplexer, Drops) {
        let drops: Drops = Arc::default();
        let sink = drops.clone();
        let on_drop: DropCallback = Arc::new(move |kind, _body, reason| {
            sink.lock().push((kind.to_string(), reason.to_string()));
        });

        (Multiplexer::new(handlers).with_on_drop(on_drop), drops)
    }

    fn failing() -> impl Handler {
        handler_fn(|_| async { Err::<(), HandlerError>("deployment locked".into()) })
    }

    #[tokio::test]
    async fn success_acks() {
        // Given
        let handlers = Handlers::new().with("release", handler_fn(|_| async { Ok(()) }));
        let (multiplexer, drops) = multiplexer(handlers);
        let finalizer = RecordingFinalizer::default();
        let delivery = Delivery::new(b"{}".to_vec(), finalizer.clone()).with_kind("release");

        // When
        let outcome = multiplexer.dispatch(&delivery).await;

        // Then
        assert_eq!(outcome, DispatchOutcome::Acked);
        assert_eq!(finalizer.settlements(), vec![Settlement::Ack]);
        assert!(drops.lock().is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_is_dropped_once() {
        // Given
        let (multiplexer, drops) = multiplexer(Handlers::new());
        let finalizer = RecordingFinalizer::default();
        let delivery = Delivery::new(b"{}".to_vec(), finalizer.clone()).with_kind("mystery");

        // When
        let outcome = multiplexer.dispatch(&delivery).await;

        // Then
        assert_eq!(outcome, DispatchOutcome::Unhandled);
        assert_eq!(
            finalizer.settlements(),
            vec![Settlement::Nack { requeue: false }],
        );
        assert_eq!(
            *drops.lock(),
            vec![("mystery".to_string(), "no handler".to_string())],
        );
    }

    #[tokio::test]
    async fn first_failure_requeues() {
        // Given
        let (multiplexer, drops) = multiplexer(Handlers::new().with("release", failing()));
        let finalizer = RecordingFinalizer::default();
        let delivery = Delivery::new(b"{}".to_vec(), finalizer.clone()).with_kind("release");

        // When
        let outcome = multiplexer.dispatch(&delivery).await;

        // Then
        assert_eq!(outcome, DispatchOutcome::Requeued);
        assert_eq!(
            finalizer.settlements(),
            vec![Settlement::Nack { requeue: true }],
        );
        assert!(drops.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_redelivery_is_dropped() {
        // Given
        let (multiplexer, drops) = multiplexer(Handlers::new().with("release", failing()));
        let finalizer = RecordingFinalizer::default();
        let delivery = Delivery::new(b"{}".to_vec(), finalizer.clone())
            .with_kind("release")
            .with_redelivered(true);

        // When
        let outcome = multiplexer.dispatch(&delivery).await;

        // Then
        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert_eq!(
            finalizer.settlements(),
            vec![Settlement::Nack { requeue: false }],
        );
        assert_eq!(
            *drops.lock(),
            vec![(
                "release".to_string(),
                "handler failed: deployment locked".to_string(),
            )],
        );
    }

    #[tokio::test]
    async fn outcomes_are_counted() {
        // Given
        let metrics = ReleaseMetrics::new("test").unwrap();
        let handlers = Handlers::new()
            .with("release", handler_fn(|_| async { Ok(()) }))
            .with("rollback", failing());
        let (multiplexer, _drops) = multiplexer(handlers);
        let multiplexer = multiplexer.with_metrics(metrics.clone());
        let deliveries = [
            Delivery::new(b"{}".to_vec(), RecordingFinalizer::default()).with_kind("release"),
            Delivery::new(b"{}".to_vec(), RecordingFinalizer::default()).with_kind("release"),
            Delivery::new(b"{}".to_vec(), RecordingFinalizer::default()).with_kind("rollback"),
            Delivery::new(b"{}".to_vec(), RecordingFinalizer::default())
                .with_kind("rollback")
                .with_redelivered(true),
            Delivery::new(b"{}".to_vec(), RecordingFinalizer::default()).with_kind("mystery"),
        ];

        // When
        for delivery in &deliveries {
            multiplexer.dispatch(delivery).await;
        }

        // Then
        assert_eq!(metrics.deliveries("release", "acked"), 2);
        assert_eq!(metrics.deliveries("rollback", "requeued"), 1);
        assert_eq!(metrics.deliveries("rollback", "dropped"), 1);
        assert_eq!(metrics.deliveries("mystery", "unhandled"), 1);
        assert_eq!(metrics.deliveries("release", "dropped"), 0);
    }

    #[tokio::test]
    async fn panic_counts_as_failure() {
        // Given
        let handlers = Handlers::new().with(
            "release",
            handler_fn(|body| async move {
                if body.is_empty() {
                    panic!("empty body");
                }
                Ok(())
            }),
        );
        let (multiplexer, _drops) = multiplexer(handlers);
        let finalizer = RecordingFinalizer::default();
        let delivery = Delivery::new(Vec::new(), finalizer.clone()).with_kind("release");

        // When
        let outcome = multiplexer.dispatch(&delivery).await;

        // Then
        assert_eq!(outcome, DispatchOutcome::Requeued);
        assert_eq!(
            finalizer.settlements(),
            vec![Settlement::Nack { requeue: true }],
        );
    }

    #[tokio::test]
    async fn handler_sees_correlation_id() {
        // Given
        let seen = Arc::new(SyncMutex::new(String::new()));
        let sink = seen.clone();
        let handlers = Handlers::new().with(
            "release",
            handler_fn(move |_| {
                let sink = sink.clone();
                async move {
                    *sink.lock() = CorrelationId::extract().to_string();
                    Ok(())
                }
            }),
        );
        let (multiplexer, _drops) = multiplexer(handlers);
        let delivery = Delivery::new(b"{}".to_vec(), RecordingFinalizer::default())
            .with_kind("release")
            .with_correlation_id("req-42");

        // When
        multiplexer.dispatch(&delivery).await;

        // Then
        assert_eq!(*seen.lock(), "req-42");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Promoted {
        service: String,
    }

    impl Publishable for Promoted {
        fn kind(&self) -> &str {
            "release.promoted"
        }

        fn marshal(&self) -> Result<Vec<u8>, EncodeError> {
            to_json(self)
        }

        fn unmarshal(bytes: &[u8]) -> Result<Self, DecodeError> {
            from_json(bytes)
        }
    }

    #[tokio::test]
    async fn typed_handler_unmarshals() {
        // Given
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let handlers = Handlers::new().with(
            "release.promoted",
            typed_handler(move |message: Promoted| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(message.service);
                    Ok(())
                }
            }),
        );
        let (multiplexer, _drops) = multiplexer(handlers);
        let good = Delivery::new(
            br#"{"service":"billing"}"#.to_vec(),
            RecordingFinalizer::default(),
        )
        .with_kind("release.promoted");
        let bad = Delivery::new(b"not json".to_vec(), RecordingFinalizer::default())
            .with_kind("release.promoted");

        // When
        let good_outcome = multiplexer.dispatch(&good).await;
        let bad_outcome = multiplexer.dispatch(&bad).await;

        // Then
        assert_eq!(good_outcome, DispatchOutcome::Acked);
        assert_eq!(bad_outcome, DispatchOutcome::Requeued);
        assert_eq!(*seen.lock(), vec!["billing".to_string()]);
    }
}
