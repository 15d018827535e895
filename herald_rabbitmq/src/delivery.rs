use async_trait::async_trait;
use lapin::Error as LapinError;
use lapin::acker::Acker;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

/// Settles an incoming message with the broker.
///
/// Implemented for [`lapin::acker::Acker`].
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Acknowledges the message.
    async fn ack(&self) -> Result<(), LapinError>;

    /// Negatively acknowledges the message, optionally putting it back on the
    /// queue.
    async fn nack(&self, requeue: bool) -> Result<(), LapinError>;
}

#[async_trait]
impl Finalizer for Acker {
    async fn ack(&self) -> Result<(), LapinError> {
        Acker::ack(self, BasicAckOptions { multiple: false }).await
    }

    async fn nack(&self, requeue: bool) -> Result<(), LapinError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
    }
}

/// An incoming message together with the means to settle it.
///
/// A delivery is settled at most once: whichever of [`ack`](Delivery::ack) or
/// [`nack`](Delivery::nack) comes first wins, later calls do nothing.
pub struct Delivery {
    body: Vec<u8>,
    kind: String,
    exchange: String,
    routing_key: String,
    message_id: String,
    correlation_id: String,
    redelivered: bool,
    timestamp: Option<u64>,
    headers: FieldTable,
    finalizer: Box<dyn Finalizer>,
    finalized: AtomicBool,
}

impl Delivery {
    /// Creates a delivery with the given body, settled through the given
    /// finalizer. All properties start out empty.
    pub fn new(body: impl Into<Vec<u8>>, finalizer: impl Finalizer + 'static) -> Self {
        Self {
            body: body.into(),
            kind: String::new(),
            exchange: String::new(),
            routing_key: String::new(),
            message_id: String::new(),
            correlation_id: String::new(),
            redelivered: false,
            timestamp: None,
            headers: FieldTable::default(),
            finalizer: Box::new(finalizer),
            finalized: AtomicBool::new(false),
        }
    }

    /// Recreates this delivery with the given message type.
    pub fn with_kind(self, kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..self
        }
    }

    /// Recreates this delivery with the given exchange.
    pub fn with_exchange(self, exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            ..self
        }
    }

    /// Recreates this delivery with the given routing key.
    pub fn with_routing_key(self, routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            ..self
        }
    }

    /// Recreates this delivery with the given message ID.
    pub fn with_message_id(self, message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            ..self
        }
    }

    /// Recreates this delivery with the given correlation ID.
    pub fn with_correlation_id(self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..self
        }
    }

    /// Recreates this delivery with the given redelivery flag.
    pub fn with_redelivered(self, redelivered: bool) -> Self {
        Self {
            redelivered,
            ..self
        }
    }
}

impl From<LapinDelivery> for Delivery {
    fn from(delivery: LapinDelivery) -> Self {
        let properties = &delivery.properties;
        let text = |value: &Option<ShortString>| {
            value
                .as_ref()
                .map(|value| value.as_str().to_string())
                .unwrap_or_default()
        };

        Self {
            kind: text(properties.kind()),
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            message_id: text(properties.message_id()),
            correlation_id: text(properties.correlation_id()),
            redelivered: delivery.redelivered,
            timestamp: *properties.timestamp(),
            headers: properties.headers().clone().unwrap_or_default(),
            body: delivery.data,
            finalizer: Box::new(delivery.acker),
            finalized: AtomicBool::new(false),
        }
    }
}

impl Delivery {
    /// The message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The message type; the multiplexer routes on it.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The exchange the message was published to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The message ID, or the empty string.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The correlation ID, or the empty string.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// The publishing timestamp, in seconds since the epoch.
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// Looks up a message header.
    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers
            .inner()
            .iter()
            .find(|(name, _)| name.as_str() == key)
            .map(|(_, value)| value)
    }

    /// Reports whether this delivery was already settled.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

impl Delivery {
    /// Acknowledges this delivery. Returns `false` without contacting the
    /// broker if the delivery was already settled.
    ///
    /// A failure to acknowledge is logged; the broker will redeliver the
    /// message once the channel closes.
    pub async fn ack(&self) -> bool {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Err(error) = self.finalizer.ack().await {
            error!(
                alert = true,
                kind = self.kind.as_str(),
                message_id = self.message_id.as_str(),
                ?error,
                error_message = %error,
                byte_preview = String::from_utf8_lossy(&self.body).as_ref(),
                "Failed to acknowledge an incoming RabbitMQ message",
            );
        }

        true
    }

    /// Negatively acknowledges this delivery. Returns `false` without
    /// contacting the broker if the delivery was already settled.
    pub async fn nack(&self, requeue: bool) -> bool {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Err(error) = self.finalizer.nack(requeue).await {
            if requeue {
                warn!(
                    alert = true,
                    kind = self.kind.as_str(),
                    message_id = self.message_id.as_str(),
                    ?error,
                    error_message = %error,
                    byte_preview = String::from_utf8_lossy(&self.body).as_ref(),
                    "Failed to requeue an incoming RabbitMQ message",
                );
            } else {
                error!(
                    alert = true,
                    kind = self.kind.as_str(),
                    message_id = self.message_id.as_str(),
                    ?error,
                    error_message = %error,
                    byte_preview = String::from_utf8_lossy(&self.body).as_ref(),
                    "Failed to drop an incoming RabbitMQ message",
                );
            }
        }

        true
    }
}

impl Debug for Delivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("kind", &self.kind)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("message_id", &self.message_id)
            .field("correlation_id", &self.correlation_id)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.body.len())
            .finish()
    }
}
