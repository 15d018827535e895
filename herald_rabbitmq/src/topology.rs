use herald_core::config_fields;
use lapin::ExchangeKind as LapinExchangeKind;
use serde::de::{Error as DeError, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// The exchange kinds a [`Topology`] may declare.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes by matching the routing key against the bound patterns.
    #[default]
    Topic,

    /// Routes every message to every bound queue; the routing key is ignored.
    #[serde(alias = "fan")]
    Fanout,
}

impl ExchangeKind {
    /// The matching [`lapin::ExchangeKind`].
    pub fn lapin_value(&self) -> LapinExchangeKind {
        match self {
            Self::Topic => LapinExchangeKind::Topic,
            Self::Fanout => LapinExchangeKind::Fanout,
        }
    }
}

impl Display for ExchangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        })
    }
}

/// Describes what a single consumer listens to: the exchange, the queue bound
/// to it and the routing patterns of the binding, plus how the queue is
/// consumed (prefetch and number of parallel workers).
///
/// Names are given without the process-wide prefix; the
/// [`Declarator`](crate::Declarator) prepends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: String,
    kind: ExchangeKind,
    queue: String,
    durable: bool,
    routing_patterns: Vec<String>,
    prefetch: u16,
    worker_count: usize,
}

/// Builds a validated [`Topology`].
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    exchange: String,
    kind: ExchangeKind,
    queue: String,
    durable: bool,
    routing_patterns: Vec<String>,
    prefetch: u16,
    worker_count: usize,
}

/// A [`Topology`] that cannot be declared.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// No exchange name was given.
    #[error("invalid topology for queue '{queue}': expected an exchange name, found none")]
    MissingExchange {
        /// Queue name
        queue: String,
    },

    /// No queue name was given.
    #[error("invalid topology for exchange '{exchange}': expected a queue name, found none")]
    MissingQueue {
        /// Exchange name
        exchange: String,
    },

    /// A topic exchange without routing patterns would never deliver anything
    /// to the queue.
    #[error(
        "invalid topology for queue '{queue}' on topic exchange '{exchange}': expected at least one routing pattern, found none"
    )]
    MissingRoutingPatterns {
        /// Exchange name
        exchange: String,
        /// Queue name
        queue: String,
    },
}

impl Topology {
    /// Starts building a new topology.
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    /// Exchange name, without prefix.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Exchange kind.
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Queue name, without prefix.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the queue survives broker restarts. A durable queue is a
    /// single-active-consumer quorum queue and never auto-deleted; a
    /// transient queue is auto-deleted.
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Routing patterns. Ignored for fanout exchanges, which bind once with
    /// the empty key.
    pub fn routing_patterns(&self) -> &[String] {
        &self.routing_patterns
    }

    /// QoS prefetch; zero leaves QoS unset.
    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Number of parallel workers consuming the queue, never less than one.
    pub fn worker_count(&self) -> usize {
        self.worker_count.max(1)
    }

    /// The keys to bind the queue with: the routing patterns for a topic
    /// exchange, a single empty key for a fanout exchange.
    pub fn binding_keys(&self) -> Vec<&str> {
        match self.kind {
            ExchangeKind::Topic => self.routing_patterns.iter().map(String::as_str).collect(),
            ExchangeKind::Fanout => vec![""],
        }
    }
}

impl TopologyBuilder {
    /// Creates a builder with a transient topic-exchange topology and one
    /// worker.
    pub fn new() -> Self {
        Self {
            exchange: String::new(),
            kind: ExchangeKind::default(),
            queue: String::new(),
            durable: false,
            routing_patterns: Vec::new(),
            prefetch: 0,
            worker_count: 1,
        }
    }

    /// Sets the exchange name.
    pub fn with_exchange(self, exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            ..self
        }
    }

    /// Sets the exchange kind.
    pub fn with_kind(self, kind: ExchangeKind) -> Self {
        Self { kind, ..self }
    }

    /// Sets the queue name.
    pub fn with_queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..self
        }
    }

    /// Sets durability.
    pub fn with_durable(self, durable: bool) -> Self {
        Self { durable, ..self }
    }

    /// Adds a routing pattern. Duplicates are ignored.
    pub fn with_routing_pattern(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();

        if !self.routing_patterns.contains(&pattern) {
            self.routing_patterns.push(pattern);
        }

        self
    }

    /// Sets the QoS prefetch.
    pub fn with_prefetch(self, prefetch: u16) -> Self {
        Self { prefetch, ..self }
    }

    /// Sets the number of workers. Zero is treated as one.
    pub fn with_worker_count(self, worker_count: usize) -> Self {
        Self {
            worker_count,
            ..self
        }
    }

    /// Validates and builds the topology.
    pub fn build(self) -> Result<Topology, TopologyError> {
        self.validate()?;

        Ok(Topology {
            exchange: self.exchange,
            kind: self.kind,
            queue: self.queue,
            durable: self.durable,
            routing_patterns: self.routing_patterns,
            prefetch: self.prefetch,
            worker_count: self.worker_count.max(1),
        })
    }

    fn validate(&self) -> Result<(), TopologyError> {
        if self.exchange.is_empty() {
            return Err(TopologyError::MissingExchange {
                queue: self.queue.clone(),
            });
        }

        if self.queue.is_empty() {
            return Err(TopologyError::MissingQueue {
                exchange: self.exchange.clone(),
            });
        }

        if self.kind == ExchangeKind::Topic && self.routing_patterns.is_empty() {
            return Err(TopologyError::MissingRoutingPatterns {
                exchange: self.exchange.clone(),
                queue: self.queue.clone(),
            });
        }

        Ok(())
    }
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for Topology {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(TopologyVisitor)
        }
    }

    struct TopologyVisitor;

    impl<'de> Visitor<'de> for TopologyVisitor {
        type Value = Topology;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of consumer topology")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut exchange: Option<String> = None;
            let mut kind = None;
            let mut queue: Option<String> = None;
            let mut durable = None;
            let mut routing_patterns: Option<Vec<String>> = None;
            let mut prefetch = None;
            let mut worker_count = None;

            while let Some(key) = map.next_key()? {
                match key {
                    TopologyField::exchange => key.poll(&mut map, &mut exchange)?,
                    TopologyField::kind => key.poll(&mut map, &mut kind)?,
                    TopologyField::queue => key.poll(&mut map, &mut queue)?,
                    TopologyField::durable => key.poll(&mut map, &mut durable)?,
                    TopologyField::routing_patterns => {
                        key.poll(&mut map, &mut routing_patterns)?
                    }
                    TopologyField::prefetch => key.poll(&mut map, &mut prefetch)?,
                    TopologyField::worker_count => key.poll(&mut map, &mut worker_count)?,
                    TopologyField::__ignore => map.next_value()?,
                };
            }

            let mut builder = Topology::builder()
                .with_exchange(TopologyField::exchange.take::<_, A::Error>(exchange)?)
                .with_kind(kind.unwrap_or_default())
                .with_queue(TopologyField::queue.take::<_, A::Error>(queue)?)
                .with_durable(durable.unwrap_or(false))
                .with_prefetch(prefetch.unwrap_or(0))
                .with_worker_count(worker_count.unwrap_or(1));

            for pattern in routing_patterns.unwrap_or_default() {
                builder = builder.with_routing_pattern(pattern);
            }

            builder.build().map_err(DeError::custom)
        }
    }

    config_fields!(
        TopologyField,
        exchange,
        kind | exchange_kind,
        queue,
        durable,
        routing_patterns | routing_keys | patterns | binding_keys,
        prefetch | prefetch_count | qos,
        worker_count | workers,
    );
};
