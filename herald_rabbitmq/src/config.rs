use crate::{ExchangeKind, Handle, PublishMode, Topology};
use herald_core::config_fields;
use serde::de::{Error as DeError, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_value::Value;
use std::collections::BTreeMap;
use std::fmt::Formatter;
use std::time::Duration;

/// Everything a [`Worker`](crate::Worker) needs to know: the broker
/// [`Handle`], the name prefix, the publisher's default exchange and
/// behavior, the lifecycle timeouts and the consumer topologies.
///
/// When deserialized, the connection parameters may be given under a
/// `handle` key or directly at the top level, next to the other keys.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    handle: Handle,
    prefix: String,
    exchange: String,
    exchange_kind: ExchangeKind,
    republish_timeout: Duration,
    max_unconfirmed_in_flight: usize,
    init_timeout: Duration,
    close_timeout: Duration,
    consumers: Vec<Topology>,
}

impl BrokerConfig {
    /// Creates a config for the given handle with default settings.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            prefix: String::new(),
            exchange: String::new(),
            exchange_kind: ExchangeKind::default(),
            republish_timeout: Self::default_republish_timeout(),
            max_unconfirmed_in_flight: Self::default_max_unconfirmed_in_flight(),
            init_timeout: Self::default_init_timeout(),
            close_timeout: Self::default_close_timeout(),
            consumers: Vec::new(),
        }
    }

    /// Recreates this config with the given name prefix.
    pub fn with_prefix(self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..self
        }
    }

    /// Recreates this config with the given default publishing exchange.
    pub fn with_exchange(self, exchange: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind: kind,
            ..self
        }
    }

    /// Recreates this config with the given republish timeout.
    pub fn with_republish_timeout(self, republish_timeout: Duration) -> Self {
        Self {
            republish_timeout,
            ..self
        }
    }

    /// Recreates this config with the given confirmation window; zero selects
    /// transactional publishing.
    pub fn with_max_unconfirmed_in_flight(self, max_unconfirmed_in_flight: usize) -> Self {
        Self {
            max_unconfirmed_in_flight,
            ..self
        }
    }

    /// Recreates this config with the given initialization timeout.
    pub fn with_init_timeout(self, init_timeout: Duration) -> Self {
        Self {
            init_timeout,
            ..self
        }
    }

    /// Recreates this config with the given close timeout.
    pub fn with_close_timeout(self, close_timeout: Duration) -> Self {
        Self {
            close_timeout,
            ..self
        }
    }

    /// Recreates this config with one more consumer topology.
    pub fn with_consumer(mut self, topology: Topology) -> Self {
        self.consumers.push(topology);
        self
    }
}

impl BrokerConfig {
    /// The broker connection parameters.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The prefix prepended to every exchange and queue name.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The default publishing exchange, unprefixed.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The kind of the default publishing exchange.
    pub fn exchange_kind(&self) -> ExchangeKind {
        self.exchange_kind
    }

    /// How long a publish waits for a confirmation before sending again.
    pub fn republish_timeout(&self) -> Duration {
        self.republish_timeout
    }

    /// The confirmation window.
    pub fn max_unconfirmed_in_flight(&self) -> usize {
        self.max_unconfirmed_in_flight
    }

    /// The publishing mode implied by the confirmation window.
    pub fn publish_mode(&self) -> PublishMode {
        PublishMode::from_max_unconfirmed(self.max_unconfirmed_in_flight)
    }

    /// How long the worker waits for the connection and the publisher to
    /// become ready.
    pub fn init_timeout(&self) -> Duration {
        self.init_timeout
    }

    /// How long closing waits for background tasks to finish.
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// The consumer topologies declared when the worker starts.
    pub fn consumers(&self) -> &[Topology] {
        &self.consumers
    }
}

impl BrokerConfig {
    fn default_republish_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_max_unconfirmed_in_flight() -> usize {
        1
    }

    fn default_init_timeout() -> Duration {
        Duration::from_secs(10)
    }

    fn default_close_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new(Handle::default())
    }
}

impl AsRef<BrokerConfig> for BrokerConfig {
    fn as_ref(&self) -> &BrokerConfig {
        self
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for BrokerConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(BrokerConfigVisitor)
        }
    }

    struct BrokerConfigVisitor;

    impl<'de> Visitor<'de> for BrokerConfigVisitor {
        type Value = BrokerConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of broker configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut handle = None;
            let mut prefix = None;
            let mut exchange = None;
            let mut exchange_kind = None;
            let mut republish_timeout = None;
            let mut max_unconfirmed_in_flight = None;
            let mut init_timeout = None;
            let mut close_timeout = None;
            let mut consumers = None;

            // Unknown keys are kept: they may be flattened connection parameters
            let mut leftover = BTreeMap::new();

            while let Some(key) = map.next_key::<Value>()? {
                let field = BrokerConfigField::deserialize(key.clone()).map_err(DeError::custom)?;

                match field {
                    BrokerConfigField::handle => field.poll(&mut map, &mut handle)?,
                    BrokerConfigField::prefix => field.poll(&mut map, &mut prefix)?,
                    BrokerConfigField::exchange => field.poll(&mut map, &mut exchange)?,
                    BrokerConfigField::exchange_kind => {
                        field.poll(&mut map, &mut exchange_kind)?
                    }
                    BrokerConfigField::republish_timeout => {
                        field.poll_duration(&mut map, &mut republish_timeout)?
                    }
                    BrokerConfigField::max_unconfirmed_in_flight => {
                        field.poll(&mut map, &mut max_unconfirmed_in_flight)?
                    }
                    BrokerConfigField::init_timeout => {
                        field.poll_duration(&mut map, &mut init_timeout)?
                    }
                    BrokerConfigField::close_timeout => {
                        field.poll_duration(&mut map, &mut close_timeout)?
                    }
                    BrokerConfigField::consumers => field.poll(&mut map, &mut consumers)?,
                    BrokerConfigField::__ignore => {
                        leftover.insert(key, map.next_value()?);
                        serde::de::IgnoredAny
                    }
                };
            }

            let handle = match handle {
                Some(handle) => handle,
                None => Handle::deserialize(Value::Map(leftover)).map_err(DeError::custom)?,
            };

            Ok(BrokerConfig {
                handle,
                prefix: prefix.unwrap_or_default(),
                exchange: exchange.unwrap_or_default(),
                exchange_kind: exchange_kind.unwrap_or_default(),
                republish_timeout: republish_timeout
                    .unwrap_or_else(BrokerConfig::default_republish_timeout),
                max_unconfirmed_in_flight: max_unconfirmed_in_flight
                    .unwrap_or_else(BrokerConfig::default_max_unconfirmed_in_flight),
                init_timeout: init_timeout.unwrap_or_else(BrokerConfig::default_init_timeout),
                close_timeout: close_timeout.unwrap_or_else(BrokerConfig::default_close_timeout),
                consumers: consumers.unwrap_or_default(),
            })
        }
    }

    config_fields!(
        BrokerConfigField,
        handle | connection,
        prefix | name_prefix,
        exchange | default_exchange,
        exchange_kind,
        republish_timeout | confirm_timeout,
        max_unconfirmed_in_flight | max_in_flight,
        init_timeout | ready_timeout,
        close_timeout | shutdown_timeout,
        consumers | subscribers | topologies,
    );
};
