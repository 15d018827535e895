use crate::ExchangeKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// The content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// An outbound message type.
///
/// The [`kind`](Publishable::kind) goes into the AMQP `type` property and is
/// also the key the receiving [`Multiplexer`](crate::Multiplexer) routes on.
/// An empty [exchange](Publishable::exchange) publishes to the worker's
/// default exchange; fanout messages leave the
/// [routing key](Publishable::routing_key) empty.
///
/// Most implementations marshal to JSON with [`to_json`] and [`from_json`]:
///
/// ```
/// use herald_rabbitmq::{DecodeError, EncodeError, Publishable, from_json, to_json};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Promoted {
///     service: String,
///     environment: String,
/// }
///
/// impl Publishable for Promoted {
///     fn kind(&self) -> &str {
///         "release.promoted"
///     }
///
///     fn routing_key(&self) -> &str {
///         "release.promoted.production"
///     }
///
///     fn marshal(&self) -> Result<Vec<u8>, EncodeError> {
///         to_json(self)
///     }
///
///     fn unmarshal(bytes: &[u8]) -> Result<Self, DecodeError> {
///         from_json(bytes)
///     }
/// }
/// ```
pub trait Publishable: Sized + Send + Sync {
    /// The message type.
    fn kind(&self) -> &str;

    /// The target exchange, without the process-wide prefix.
    fn exchange(&self) -> &str {
        ""
    }

    /// The kind the [exchange](Publishable::exchange) is declared with. Not
    /// consulted for the worker's default exchange.
    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Topic
    }

    /// The routing key.
    fn routing_key(&self) -> &str {
        ""
    }

    /// Serializes the message body.
    fn marshal(&self) -> Result<Vec<u8>, EncodeError>;

    /// Deserializes a message body produced by [`marshal`](Publishable::marshal).
    fn unmarshal(bytes: &[u8]) -> Result<Self, DecodeError>;
}

/// A message body could not be serialized.
#[derive(Debug, Error)]
#[error("failed to encode a message body: {0}")]
pub struct EncodeError(#[source] Box<dyn std::error::Error + Send + Sync>);

/// A message body could not be deserialized.
#[derive(Debug, Error)]
#[error("failed to decode a message body: {0}")]
pub struct DecodeError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl EncodeError {
    /// Wraps any error as an encoding failure.
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

impl DecodeError {
    /// Wraps any error as a decoding failure.
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

impl From<serde_json::Error> for EncodeError {
    fn from(value: serde_json::Error) -> Self {
        Self::new(value)
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(value: serde_json::Error) -> Self {
        Self::new(value)
    }
}

/// Serializes the given value as JSON.
pub fn to_json<T>(value: &T) -> Result<Vec<u8>, EncodeError>
where
    T: Serialize + ?Sized,
{
    Ok(serde_json::to_vec(value)?)
}

/// Deserializes a value from JSON.
pub fn from_json<T>(bytes: &[u8]) -> Result<T, DecodeError>
where
    T: DeserializeOwned,
{
    Ok(serde_json::from_slice(bytes)?)
}
