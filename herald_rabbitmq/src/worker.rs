use crate::connector::dialer::{AmqpDialer, Dialer};
use crate::connector::state::ConnectionState;
use crate::{
    BrokerConfig, Connector, Consumer, DeclarationError, Declarator, DropCallback, Gateway,
    GatewayError, Handlers, Multiplexer, Publishable, Publisher, RepublishHook, Topology,
    WorkerError,
};
use futures::future::join_all;
use herald_core::{Latch, Scope, Spindown};
use herald_telemetry::{Logger, ReleaseMetrics, TracingLogger};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::select;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Optional seams and callbacks of a [`Worker`].
#[derive(Clone, Default)]
pub struct Hooks {
    dialer: Option<Arc<dyn Dialer>>,
    on_republish: Option<RepublishHook>,
    on_drop: Option<DropCallback>,
    logger: Option<Arc<dyn Logger>>,
    metrics: Option<ReleaseMetrics>,
}

impl Hooks {
    /// Dials through the given [`Dialer`] instead of [`AmqpDialer`].
    pub fn with_dialer(self, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer: Some(dialer),
            ..self
        }
    }

    /// Calls the given hook on every republish.
    pub fn with_on_republish(self, on_republish: RepublishHook) -> Self {
        Self {
            on_republish: Some(on_republish),
            ..self
        }
    }

    /// Calls the given callback for every dropped delivery.
    pub fn with_on_drop(self, on_drop: DropCallback) -> Self {
        Self {
            on_drop: Some(on_drop),
            ..self
        }
    }

    /// Reports lifecycle events to the given [`Logger`] instead of a
    /// [`TracingLogger`] tagged with the worker name.
    pub fn with_logger(self, logger: Arc<dyn Logger>) -> Self {
        Self {
            logger: Some(logger),
            ..self
        }
    }

    /// Counts publishes, republishes and deliveries on the given metrics.
    pub fn with_metrics(self, metrics: ReleaseMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..self
        }
    }
}

/// The broker client of one application component: a supervised connection,
/// a confirmed publisher and any number of consumers, all living until
/// [`close`](Worker::close).
///
/// Every worker owns its own [`Scope`] and [`Spindown`]: several workers may
/// coexist in one process without affecting each other.
pub struct Worker {
    name: Arc<str>,
    config: BrokerConfig,
    scope: Scope,
    spindown: Spindown,
    gateway: Gateway,
    declarator: Arc<Declarator>,
    publisher: Publisher,
    on_drop: Option<DropCallback>,
    logger: Arc<dyn Logger>,
    metrics: Option<ReleaseMetrics>,
    closed: AtomicBool,
}

impl Worker {
    /// Connects to the broker, declares the configured consumer topologies
    /// and readies the publisher.
    ///
    /// Fails with [`WorkerError::Dial`] if the broker cannot be reached, and
    /// with [`WorkerError::InitTimeout`] if connecting, or declaring and
    /// readying together, take longer than the configured initialization
    /// timeout.
    pub async fn new(config: BrokerConfig) -> Result<Self, WorkerError> {
        Self::with_hooks(config, Hooks::default()).await
    }

    /// Same as [`new`](Worker::new), with the given [`Hooks`].
    pub async fn with_hooks(config: BrokerConfig, hooks: Hooks) -> Result<Self, WorkerError> {
        let name = Self::compose_name(config.handle().name());
        let logger: Arc<dyn Logger> = match &hooks.logger {
            Some(logger) => logger.clone(),
            None => Arc::new(TracingLogger::new(name.as_ref())),
        };

        let started = Self::start(name.clone(), config, hooks, logger.clone()).await;

        if let Err(error) = &started {
            logger.error(format_args!(
                "Failed to start the RabbitMQ worker {}: {}",
                name, error,
            ));
        }

        started
    }

    async fn start(
        name: Arc<str>,
        config: BrokerConfig,
        hooks: Hooks,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, WorkerError> {
        let scope = Scope::new(name.as_ref());
        let spindown = Spindown::new(config.close_timeout());
        let dialer = hooks.dialer.unwrap_or_else(|| Arc::new(AmqpDialer));

        let started = timeout(
            config.init_timeout(),
            Connector::start(config.handle().clone(), dialer, scope.clone(), &spindown),
        )
        .await;

        let gateway = match started {
            Ok(Ok(gateway)) => gateway,
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => {
                scope.cancel();
                return Err(WorkerError::InitTimeout("dialer"));
            }
        };

        let declarator = Arc::new(Declarator::new(config.prefix()));
        let mut publisher = Publisher::new(gateway.clone(), declarator.clone(), &scope)
            .with_exchange(config.exchange(), config.exchange_kind())
            .with_mode(config.publish_mode())
            .with_republish_timeout(config.republish_timeout());
        if let Some(on_republish) = hooks.on_republish {
            publisher = publisher.with_on_republish(on_republish);
        }
        if let Some(metrics) = &hooks.metrics {
            publisher = publisher.with_metrics(metrics.clone());
        }

        let readied = Self::prepare(
            &gateway,
            &declarator,
            &publisher,
            config.consumers(),
            config.init_timeout(),
        )
        .await;

        if let Err(error) = readied {
            scope.cancel();
            return Err(error);
        }

        logger.info(format_args!(
            "RabbitMQ worker {} is ready at {} with {} consumer topologies",
            name,
            config.handle(),
            config.consumers().len(),
        ));

        Ok(Self {
            name,
            config,
            scope,
            spindown,
            gateway,
            declarator,
            publisher,
            on_drop: hooks.on_drop,
            logger,
            metrics: hooks.metrics,
            closed: AtomicBool::new(false),
        })
    }

    fn compose_name(handle: &str) -> Arc<str> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        Arc::from(format!(
            "rabbitmq:worker:{}:{}",
            handle,
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }

    /// Declares the consumer topologies, then readies the publisher. Both
    /// steps share one initialization budget.
    async fn prepare(
        gateway: &Gateway,
        declarator: &Declarator,
        publisher: &Publisher,
        consumers: &[Topology],
        init_timeout: Duration,
    ) -> Result<(), WorkerError> {
        let deadline = Instant::now() + init_timeout;

        match timeout_at(deadline, Self::declare(gateway, declarator, consumers)).await {
            Ok(declared) => declared.map_err(declaration_error)?,
            Err(_) => return Err(WorkerError::InitTimeout("topology")),
        }

        match timeout_at(deadline, publisher.ready()).await {
            Ok(readied) => readied.map_err(declaration_error),
            Err(_) => Err(WorkerError::InitTimeout("publisher")),
        }
    }

    async fn declare(
        gateway: &Gateway,
        declarator: &Declarator,
        consumers: &[Topology],
    ) -> Result<(), DeclarationError> {
        if consumers.is_empty() {
            return Ok(());
        }

        let channel = gateway.channel().await?;

        for topology in consumers {
            declarator
                .declare(channel.channel(), channel.generation(), topology)
                .await?;
        }

        let _ = channel.channel().close(200, "Declared").await;

        Ok(())
    }
}

impl Worker {
    /// Reports the name of this worker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exposes the configuration this worker was created with.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Reports the state of the underlying connection.
    pub fn state(&self) -> ConnectionState {
        self.gateway.state()
    }

    /// Exposes the metrics this worker counts on, if any.
    pub fn metrics(&self) -> Option<&ReleaseMetrics> {
        self.metrics.as_ref()
    }

    /// Reports whether [`close`](Worker::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publishes the given message and waits for the broker to confirm it.
    pub async fn publish<P>(&self, message: &P) -> Result<(), WorkerError>
    where
        P: Publishable,
    {
        Ok(self.publisher.publish(message).await?)
    }

    /// Same as [`publish`](Worker::publish), but gives up with
    /// [`WorkerError::Cancelled`] once the given token is cancelled.
    pub async fn publish_until<P>(
        &self,
        message: &P,
        cancellation: &CancellationToken,
    ) -> Result<(), WorkerError>
    where
        P: Publishable,
    {
        Ok(self.publisher.publish_until(message, cancellation).await?)
    }

    /// Consumes the queues of the given topologies, dispatching deliveries to
    /// the given handlers, until the worker is closed or the connection is
    /// given up on.
    ///
    /// Releases `started` once every queue is being consumed. Declaration
    /// failures up to that point are returned; later ones are retried.
    pub async fn start_consumer(
        &self,
        topologies: &[Topology],
        handlers: Handlers,
        started: &Latch,
    ) -> Result<Infallible, WorkerError> {
        if self.scope.is_cancelled() {
            return Err(WorkerError::Closed);
        }

        let _spindown_token = self.spindown.register(format!("{}:consumers", self.name));

        let mut multiplexer = Multiplexer::new(handlers);
        if let Some(on_drop) = &self.on_drop {
            multiplexer = multiplexer.with_on_drop(on_drop.clone());
        }
        if let Some(metrics) = &self.metrics {
            multiplexer = multiplexer.with_metrics(metrics.clone());
        }

        let consumers = topologies
            .iter()
            .map(|topology| {
                Consumer::new(
                    self.gateway.clone(),
                    self.declarator.clone(),
                    topology.clone(),
                    multiplexer.clone(),
                    &self.scope,
                )
                .with_backoff(self.config.handle().backoff().clone())
            })
            .collect::<Vec<_>>();

        let mut subscriptions = Vec::with_capacity(consumers.len());
        for consumer in &consumers {
            let subscribed = select! {
                biased;
                _ = self.scope.cancelled() => return Err(WorkerError::Closed),
                subscribed = consumer.subscribe() => subscribed,
            };

            subscriptions.push(subscribed.map_err(declaration_error)?);
        }

        started.release();

        let terminal = if consumers.is_empty() {
            self.gateway.terminated().await
        } else {
            let stopped = join_all(
                consumers
                    .iter()
                    .zip(subscriptions)
                    .map(|(consumer, subscription)| consumer.serve(subscription)),
            )
            .await;

            stopped
                .into_iter()
                .find(|error| *error != GatewayError::Closed)
                .unwrap_or(GatewayError::Closed)
        };

        Err(terminal.into())
    }

    /// Closes the publisher, stops the consumers and the connection, and waits
    /// for all of them to finish within the close timeout. Only the first call
    /// does anything.
    pub async fn close(&self) -> Result<(), WorkerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.logger.info(format_args!("Closing the RabbitMQ worker {}", self.name));

        self.publisher.close();
        self.scope.cancel();

        match self.spindown.completed().await {
            Ok(count) => self.logger.info(format_args!(
                "Closed the RabbitMQ worker {} after {} workloads spun down",
                self.name, count,
            )),
            Err(error) => warn!(
                alert = true,
                name = self.name.as_ref(),
                timeout = ?self.close_timeout(),
                ?error,
                error_message = %error,
                "RabbitMQ worker did not close in time",
            ),
        }

        Ok(())
    }

    fn close_timeout(&self) -> Duration {
        self.config.close_timeout()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// Lifts the gateway failure out of a declaration error.
fn declaration_error(error: DeclarationError) -> WorkerError {
    match error.gateway_error() {
        Some(gateway_error) => gateway_error.into(),
        None => error.into(),
    }
}
