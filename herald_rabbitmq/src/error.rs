use crate::{EncodeError, HandleError, TopologyError};
use lapin::Error as LapinError;
use std::time::Duration;
use thiserror::Error;

/// The error type of the [`Worker`](crate::Worker) facade.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker was closed before or during the operation.
    #[error("broker was closed")]
    Closed,

    /// The connection was lost and could not be re-established within the
    /// configured number of attempts.
    #[error("Tried to reconnect {0} times. Giving up")]
    ReconnectExhausted(u32),

    /// A component did not become ready within the initialization timeout.
    #[error("timed out waiting for the {0} to become ready")]
    InitTimeout(&'static str),

    /// The caller cancelled the operation.
    #[error("operation was cancelled")]
    Cancelled,

    /// The initial connection could not be established.
    #[error(transparent)]
    Dial(#[from] DialError),

    /// Exchanges, queues or bindings could not be declared.
    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    /// A message body could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The connection parameters are invalid.
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// A consumer topology is invalid.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Why a [`Gateway`](crate::Gateway) could not hand out a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The owning worker was closed.
    #[error("broker was closed")]
    Closed,

    /// The connector gave up reconnecting.
    #[error("Tried to reconnect {0} times. Giving up")]
    ReconnectExhausted(u32),
}

/// A single dial attempt failed.
#[derive(Debug, Error)]
pub enum DialError {
    /// The TCP and AMQP handshake did not complete in time.
    #[error("timed out after {timeout:?} connecting to RabbitMQ at '{identifier}'")]
    Timeout {
        /// Masked broker identifier
        identifier: String,
        /// The dial timeout
        timeout: Duration,
    },

    /// The broker refused the connection or the network failed.
    #[error("failed to connect to RabbitMQ at '{identifier}': {source}")]
    Failed {
        /// Masked broker identifier
        identifier: String,
        /// The underlying error
        source: LapinError,
    },
}

/// An exchange, queue, binding or consumer could not be declared.
#[derive(Debug, Error)]
pub enum DeclarationError {
    /// No channel could be obtained to declare on.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// `exchange.declare` failed.
    #[error("failed to declare exchange '{exchange}': {source}")]
    Exchange {
        /// Prefixed exchange name
        exchange: String,
        /// The underlying error
        source: LapinError,
    },

    /// `queue.declare` failed.
    #[error("failed to declare queue '{queue}': {source}")]
    Queue {
        /// Prefixed queue name
        queue: String,
        /// The underlying error
        source: LapinError,
    },

    /// `queue.bind` failed.
    #[error(
        "failed to bind queue '{queue}' to exchange '{exchange}' with patterns {patterns:?}: {source}"
    )]
    Binding {
        /// Prefixed queue name
        queue: String,
        /// Prefixed exchange name
        exchange: String,
        /// The routing patterns of the binding
        patterns: Vec<String>,
        /// The underlying error
        source: LapinError,
    },

    /// `basic.qos` or `basic.consume` failed.
    #[error("failed to start consuming queue '{queue}': {source}")]
    Consume {
        /// Prefixed queue name
        queue: String,
        /// The underlying error
        source: LapinError,
    },

    /// Enabling publisher confirms or transactions failed.
    #[error("failed to prepare a publishing channel: {source}")]
    PublishMode {
        /// The underlying error
        source: LapinError,
    },
}

/// The error type of the [`Publisher`](crate::Publisher).
#[derive(Debug, Error)]
pub enum PublishError {
    /// The message could not be marshalled; nothing was sent.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The caller's cancellation token fired before the broker confirmed.
    #[error("publishing was cancelled")]
    Cancelled,

    /// The publisher was closed.
    #[error("broker was closed")]
    Closed,

    /// The connector gave up reconnecting.
    #[error("Tried to reconnect {0} times. Giving up")]
    ReconnectExhausted(u32),
}

impl From<GatewayError> for PublishError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::Closed => Self::Closed,
            GatewayError::ReconnectExhausted(attempts) => Self::ReconnectExhausted(attempts),
        }
    }
}

impl From<GatewayError> for WorkerError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::Closed => Self::Closed,
            GatewayError::ReconnectExhausted(attempts) => Self::ReconnectExhausted(attempts),
        }
    }
}

impl From<PublishError> for WorkerError {
    fn from(value: PublishError) -> Self {
        match value {
            PublishError::Encode(error) => Self::Encode(error),
            PublishError::Cancelled => Self::Cancelled,
            PublishError::Closed => Self::Closed,
            PublishError::ReconnectExhausted(attempts) => Self::ReconnectExhausted(attempts),
        }
    }
}

impl DeclarationError {
    /// The gateway failure behind this error, if that is what it is.
    pub fn gateway_error(&self) -> Option<GatewayError> {
        match self {
            Self::Gateway(error) => Some(*error),
            _ => None,
        }
    }
}
