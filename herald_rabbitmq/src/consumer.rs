use crate::{
    DeclarationError, Declarator, Delivery, Gateway, GatewayError, LinkedChannel, Multiplexer,
    Topology,
};
use futures::StreamExt;
use futures::future::join_all;
use herald_core::{Backoff, BackoffConfig, Scope};
use lapin::Consumer as LapinConsumer;
use lapin::options::{BasicConsumeOptions, BasicQosOptions};
use lapin::types::FieldTable;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::select;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consumes one queue described by a [`Topology`] with a pool of workers that
/// share the delivery stream and hand each delivery to a [`Multiplexer`].
///
/// When the stream ends (usually because the connection was lost), the
/// consumer declares its topology again on a fresh channel and resumes. It
/// stops when its scope is cancelled or when the connector gives up.
pub struct Consumer {
    name: Arc<str>,
    gateway: Gateway,
    declarator: Arc<Declarator>,
    topology: Topology,
    multiplexer: Multiplexer,
    backoff: BackoffConfig,
    scope: Scope,
}

/// An active `basic.consume` on a channel.
pub struct Subscription {
    channel: LinkedChannel,
    queue: String,
    stream: LapinConsumer,
}

impl Subscription {
    /// The prefixed name of the consumed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Consumer {
    /// Creates a consumer of the given topology that follows the given scope.
    pub fn new(
        gateway: Gateway,
        declarator: Arc<Declarator>,
        topology: Topology,
        multiplexer: Multiplexer,
        scope: &Scope,
    ) -> Self {
        let name = Self::compose_name(&declarator.prefixed(topology.queue()));
        let scope = scope.child(name.as_ref());

        Self {
            name,
            gateway,
            declarator,
            topology,
            multiplexer,
            backoff: BackoffConfig::default(),
            scope,
        }
    }

    /// Recreates this consumer with the given pacing of resubscription
    /// attempts. The attempt limit of the config is ignored: resubscription
    /// ends only when the connector gives up.
    pub fn with_backoff(self, backoff: BackoffConfig) -> Self {
        Self {
            backoff: backoff.with_max_attempts(0),
            ..self
        }
    }

    fn compose_name(queue: &str) -> Arc<str> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        Arc::from(format!(
            "rabbitmq:sub:{}:{}",
            queue,
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }

    /// Reports the name of this consumer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports the topology of this consumer.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

impl Consumer {
    /// Declares the topology on a fresh channel, applies the prefetch and
    /// starts consuming.
    pub async fn subscribe(&self) -> Result<Subscription, DeclarationError> {
        let channel = self.gateway.channel().await?;
        let queue = self
            .declarator
            .declare(channel.channel(), channel.generation(), &self.topology)
            .await?;

        if let Some(prefetch) = prefetch_of(&self.topology) {
            channel
                .channel()
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
                .map_err(|source| DeclarationError::Consume {
                    queue: queue.clone(),
                    source,
                })?;
        }

        let stream = channel
            .channel()
            .basic_consume(
                &queue,
                &self.name,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| DeclarationError::Consume {
                queue: queue.clone(),
                source,
            })?;

        info!(
            name = self.name.as_ref(),
            queue = queue.as_str(),
            generation = channel.generation(),
            workers = self.topology.worker_count(),
            "Started consuming a RabbitMQ queue",
        );

        Ok(Subscription {
            channel,
            queue,
            stream,
        })
    }

    /// Consumes the given subscription, resubscribing whenever its stream
    /// ends. Returns only once the consumer stops for good, with the reason.
    pub async fn serve(&self, subscription: Subscription) -> GatewayError {
        let backoff = Backoff::new(&self.backoff);
        let mut subscription = subscription;

        loop {
            self.drain(subscription).await;

            if self.scope.is_cancelled() {
                return GatewayError::Closed;
            }

            warn!(
                name = self.name.as_ref(),
                "RabbitMQ delivery stream ended; subscribing again",
            );

            subscription = loop {
                let result = select! {
                    biased;
                    _ = self.scope.cancelled() => return GatewayError::Closed,
                    result = self.subscribe() => result,
                };

                match result {
                    Ok(subscription) => {
                        backoff.reset();
                        break subscription;
                    }
                    Err(error) => {
                        if let Some(terminal) = error.gateway_error() {
                            return terminal;
                        }

                        warn!(
                            alert = true,
                            name = self.name.as_ref(),
                            ?error,
                            error_message = %error,
                            "Failed to subscribe to a RabbitMQ queue",
                        );

                        select! {
                            biased;
                            _ = self.scope.cancelled() => return GatewayError::Closed,
                            _ = backoff.sleep_next() => {},
                        }
                    }
                }
            };
        }
    }

    /// Stops this consumer.
    pub fn close(&self) {
        self.scope.cancel();
    }

    /// Runs the worker pool on the subscription until its stream ends or the
    /// scope is cancelled, then closes the channel.
    async fn drain(&self, subscription: Subscription) {
        let Subscription {
            channel,
            queue,
            stream,
        } = subscription;
        let stream = AsyncMutex::new(stream);
        let ended = self.scope.token().child_token();

        let workers =
            (0..self.topology.worker_count()).map(|index| self.work(index, &stream, &ended));
        join_all(workers).await;

        debug!(
            name = self.name.as_ref(),
            queue = queue.as_str(),
            "Closing a RabbitMQ consumer channel",
        );

        if let Err(error) = channel.channel().close(200, "Consumer stopped").await {
            debug!(
                name = self.name.as_ref(),
                ?error,
                error_message = %error,
                "Failed to close a RabbitMQ consumer channel",
            );
        }
    }

    async fn work(
        &self,
        index: usize,
        stream: &AsyncMutex<LapinConsumer>,
        ended: &CancellationToken,
    ) {
        loop {
            // The lock is held only while waiting for the next delivery
            let next = {
                let mut stream = stream.lock().await;

                select! {
                    biased;
                    _ = ended.cancelled() => None,
                    next = stream.next() => next,
                }
            };

            match next {
                Some(Ok(delivery)) => {
                    let delivery = Delivery::from(delivery);
                    let outcome = self.multiplexer.dispatch(&delivery).await;

                    debug!(
                        name = self.name.as_ref(),
                        worker = index,
                        kind = delivery.kind(),
                        ?outcome,
                        "Dispatched a RabbitMQ message",
                    );
                }
                Some(Err(error)) => {
                    warn!(
                        name = self.name.as_ref(),
                        worker = index,
                        ?error,
                        error_message = %error,
                        "RabbitMQ delivery stream failed",
                    );
                    break;
                }
                None => break,
            }
        }

        ended.cancel();
    }
}

/// A zero prefetch leaves the channel without a QoS limit.
fn prefetch_of(topology: &Topology) -> Option<u16> {
    match topology.prefetch() {
        0 => None,
        prefetch => Some(prefetch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn topology(prefetch: u16) -> Topology {
        Topology::builder()
            .with_exchange("releases")
            .with_queue("audit")
            .with_routing_pattern("#")
            .with_prefetch(prefetch)
            .build()
            .unwrap()
    }

    #[test]
    fn zero_prefetch_skips_qos() {
        assert_eq!(prefetch_of(&topology(0)), None);
        assert_eq!(prefetch_of(&topology(25)), Some(25));
    }

    #[test]
    fn names_follow_queue() {
        // When
        let name = Consumer::compose_name("test.audit");

        // Then
        assert!(name.starts_with("rabbitmq:sub:test.audit:"));
    }
}
