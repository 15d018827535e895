use crate::{DeclarationError, ExchangeKind, Topology};
use async_trait::async_trait;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Error as LapinError};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// The three AMQP methods the [`Declarator`] issues.
///
/// Implemented for [`lapin::Channel`]; other implementations exist to observe
/// the declarations without a broker.
#[async_trait]
pub trait DeclareChannel: Send + Sync {
    /// Declares a durable, non-auto-deleted exchange.
    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> Result<(), LapinError>;

    /// Declares a queue with the given durability and arguments.
    async fn declare_queue(
        &self,
        queue: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), LapinError>;

    /// Binds the queue to the exchange with one routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> Result<(), LapinError>;
}

#[async_trait]
impl DeclareChannel for Channel {
    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> Result<(), LapinError> {
        self.exchange_declare(
            exchange,
            kind.lapin_value(),
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    }

    async fn declare_queue(
        &self,
        queue: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), LapinError> {
        self.queue_declare(
            queue,
            QueueDeclareOptions {
                passive: false,
                durable,
                exclusive: false,
                auto_delete: !durable,
                nowait: false,
            },
            arguments,
        )
        .await?;

        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> Result<(), LapinError> {
        self.queue_bind(
            queue,
            exchange,
            key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    }
}

/// Declares exchanges, queues and bindings, prefixing every name with the
/// process-wide prefix.
///
/// Exchanges are declared at most once per connection generation: the set of
/// declared exchanges is reset whenever a channel of a newer generation shows
/// up. The memo stays locked across the check, the declaration and the insert,
/// so concurrent declarations of one exchange reach the broker only once.
pub struct Declarator {
    prefix: Arc<str>,
    memo: AsyncMutex<ExchangeMemo>,
}

#[derive(Default)]
struct ExchangeMemo {
    generation: u64,
    declared: HashSet<String>,
}

impl Declarator {
    /// Creates a declarator with the given name prefix.
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: Arc::from(prefix.as_ref()),
            memo: AsyncMutex::new(ExchangeMemo::default()),
        }
    }

    /// Reports the name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prepends the prefix to the given name. The empty name stands for the
    /// AMQP default exchange and stays empty.
    pub fn prefixed(&self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }

        format!("{}{}", self.prefix, name)
    }

    /// Declares the given exchange unless it was already declared on the
    /// connection of the given generation. Returns the prefixed name.
    pub async fn declare_exchange<C>(
        &self,
        channel: &C,
        generation: u64,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<String, DeclarationError>
    where
        C: DeclareChannel + ?Sized,
    {
        let exchange = self.prefixed(exchange);

        if exchange.is_empty() {
            return Ok(exchange);
        }

        let mut memo = self.memo.lock().await;

        if generation > memo.generation {
            memo.generation = generation;
            memo.declared.clear();
        }

        if memo.declared.contains(&exchange) {
            return Ok(exchange);
        }

        channel
            .declare_exchange(&exchange, kind)
            .await
            .map_err(|source| DeclarationError::Exchange {
                exchange: exchange.clone(),
                source,
            })?;

        debug!(
            exchange = exchange.as_str(),
            %kind,
            generation,
            "Declared a RabbitMQ exchange",
        );
        memo.declared.insert(exchange.clone());

        Ok(exchange)
    }

    /// Declares the exchange, the queue and the bindings of the given
    /// topology. Returns the prefixed queue name.
    pub async fn declare<C>(
        &self,
        channel: &C,
        generation: u64,
        topology: &Topology,
    ) -> Result<String, DeclarationError>
    where
        C: DeclareChannel + ?Sized,
    {
        let exchange = self
            .declare_exchange(channel, generation, topology.exchange(), topology.kind())
            .await?;
        let queue = self.prefixed(topology.queue());

        channel
            .declare_queue(&queue, topology.durable(), queue_arguments(topology.durable()))
            .await
            .map_err(|source| DeclarationError::Queue {
                queue: queue.clone(),
                source,
            })?;

        for key in topology.binding_keys() {
            channel
                .bind_queue(&queue, &exchange, key)
                .await
                .map_err(|source| DeclarationError::Binding {
                    queue: queue.clone(),
                    exchange: exchange.clone(),
                    patterns: topology.routing_patterns().to_vec(),
                    source,
                })?;
        }

        debug!(
            exchange = exchange.as_str(),
            queue = queue.as_str(),
            patterns = ?topology.routing_patterns(),
            "Declared a RabbitMQ queue and its bindings",
        );

        Ok(queue)
    }
}

/// Durable queues are quorum queues with a single active consumer.
fn queue_arguments(durable: bool) -> FieldTable {
    let mut arguments = FieldTable::default();

    if durable {
        arguments.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
        arguments.insert("x-single-active-consumer".into(), AMQPValue::Boolean(true));
    }

    arguments
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::ChannelState;
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingChannel {
        calls: SyncMutex<Vec<String>>,
        fail_bindings: bool,
    }

    impl RecordingChannel {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl DeclareChannel for RecordingChannel {
        async fn declare_exchange(
            &self,
            exchange: &str,
            kind: ExchangeKind,
        ) -> Result<(), LapinError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.calls.lock().push(format!("exchange {} {}", exchange, kind));
            Ok(())
        }

        async fn declare_queue(
            &self,
            queue: &str,
            durable: bool,
            arguments: FieldTable,
        ) -> Result<(), LapinError> {
            let quorum = arguments
                .inner()
                .keys()
                .any(|key| key.as_str() == "x-queue-type");
            self.calls
                .lock()
                .push(format!("queue {} durable={} quorum={}", queue, durable, quorum));
            Ok(())
        }

        async fn bind_queue(
            &self,
            queue: &str,
            exchange: &str,
            key: &str,
        ) -> Result<(), LapinError> {
            if self.fail_bindings {
                return Err(LapinError::InvalidChannelState(ChannelState::Closed));
            }
            self.calls
                .lock()
                .push(format!("bind {} {} '{}'", queue, exchange, key));
            Ok(())
        }
    }

    fn topology(kind: ExchangeKind, durable: bool) -> Topology {
        let builder = Topology::builder()
            .with_exchange("releases")
            .with_kind(kind)
            .with_queue("audit")
            .with_durable(durable);

        match kind {
            ExchangeKind::Topic => builder
                .with_routing_pattern("release.*")
                .with_routing_pattern("rollback.#")
                .build()
                .unwrap(),
            ExchangeKind::Fanout => builder.build().unwrap(),
        }
    }

    #[tokio::test]
    async fn concurrent_declarations_reach_broker_once() {
        // Given
        let declarator = Arc::new(Declarator::new("test."));
        let channel = Arc::new(RecordingChannel::default());

        // When
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let declarator = declarator.clone();
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                declarator
                    .declare_exchange(channel.as_ref(), 1, "releases", ExchangeKind::Topic)
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), "test.releases");
        }

        // Then
        assert_eq!(channel.calls(), vec!["exchange test.releases topic"]);
    }

    #[tokio::test]
    async fn new_generation_declares_again() {
        // Given
        let declarator = Declarator::new("");
        let channel = RecordingChannel::default();

        // When
        for generation in [1, 1, 2, 2] {
            declarator
                .declare_exchange(&channel, generation, "releases", ExchangeKind::Fanout)
                .await
                .unwrap();
        }

        // Then
        assert_eq!(
            channel.calls(),
            vec!["exchange releases fanout", "exchange releases fanout"],
        );
    }

    #[tokio::test]
    async fn default_exchange_is_never_declared() {
        // Given
        let declarator = Declarator::new("test.");
        let channel = RecordingChannel::default();

        // When
        let exchange = declarator
            .declare_exchange(&channel, 1, "", ExchangeKind::Topic)
            .await
            .unwrap();

        // Then
        assert_eq!(exchange, "");
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn durable_topic_topology() {
        // Given
        let declarator = Declarator::new("test.");
        let channel = RecordingChannel::default();

        // When
        let queue = declarator
            .declare(&channel, 1, &topology(ExchangeKind::Topic, true))
            .await
            .unwrap();

        // Then
        assert_eq!(queue, "test.audit");
        assert_eq!(
            channel.calls(),
            vec![
                "exchange test.releases topic",
                "queue test.audit durable=true quorum=true",
                "bind test.audit test.releases 'release.*'",
                "bind test.audit test.releases 'rollback.#'",
            ],
        );
    }

    #[tokio::test]
    async fn transient_fanout_topology() {
        // Given
        let declarator = Declarator::new("test.");
        let channel = RecordingChannel::default();

        // When
        declarator
            .declare(&channel, 1, &topology(ExchangeKind::Fanout, false))
            .await
            .unwrap();

        // Then
        assert_eq!(
            channel.calls(),
            vec![
                "exchange test.releases fanout",
                "queue test.audit durable=false quorum=false",
                "bind test.audit test.releases ''",
            ],
        );
    }

    #[tokio::test]
    async fn binding_error_carries_context() {
        // Given
        let declarator = Declarator::new("test.");
        let channel = RecordingChannel {
            fail_bindings: true,
            ..Default::default()
        };

        // When
        let error = declarator
            .declare(&channel, 1, &topology(ExchangeKind::Topic, true))
            .await
            .unwrap_err();

        // Then
        match error {
            DeclarationError::Binding {
                queue,
                exchange,
                patterns,
                ..
            } => {
                assert_eq!(queue, "test.audit");
                assert_eq!(exchange, "test.releases");
                assert_eq!(patterns, vec!["release.*", "rollback.#"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
