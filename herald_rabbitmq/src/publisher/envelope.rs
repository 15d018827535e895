use crate::message::CONTENT_TYPE_JSON;
use crate::{EncodeError, ExchangeKind, Publishable};
use herald_core::CorrelationId;
use lapin::BasicProperties;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// A marshalled outbound message with its wire properties fixed.
///
/// Sealed once per `publish` call: every republish of the same call sends the
/// same message ID.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    body: Vec<u8>,
    kind: String,
    exchange: String,
    exchange_kind: ExchangeKind,
    routing_key: String,
    message_id: String,
    correlation_id: CorrelationId,
    timestamp: u64,
}

impl Envelope {
    /// Marshals the given message and stamps a fresh message ID and the
    /// ambient correlation ID on it.
    pub(crate) fn seal<P>(message: &P) -> Result<Self, EncodeError>
    where
        P: Publishable,
    {
        let body = message.marshal()?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        Ok(Self {
            body,
            kind: message.kind().to_string(),
            exchange: message.exchange().to_string(),
            exchange_kind: message.exchange_kind(),
            routing_key: message.routing_key().to_string(),
            message_id: Uuid::new_v4().to_string(),
            correlation_id: CorrelationId::extract(),
            timestamp,
        })
    }

    pub(crate) fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn kind(&self) -> &str {
        &self.kind
    }

    /// The target exchange, unprefixed; empty means the publisher's default.
    pub(crate) fn exchange(&self) -> &str {
        &self.exchange
    }

    pub(crate) fn exchange_kind(&self) -> ExchangeKind {
        self.exchange_kind
    }

    pub(crate) fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub(crate) fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The AMQP properties of this envelope.
    pub(crate) fn properties(&self) -> BasicProperties {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_type(self.kind.as_str().into())
            .with_message_id(self.message_id.as_str().into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_timestamp(self.timestamp);

        if self.correlation_id.is_empty() {
            return properties;
        }

        properties.with_correlation_id(self.correlation_id.as_str().into())
    }
}
