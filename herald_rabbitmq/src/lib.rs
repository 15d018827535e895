#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the broker configuration section.
mod config;
pub use self::config::BrokerConfig;

/// Exposes the error types.
mod error;
pub use self::error::{DeclarationError, DialError, GatewayError, PublishError, WorkerError};

/// Exposes a handle for defining the connection parameters of one broker.
mod handle;
pub use self::handle::{Handle, HandleError};

/// Exposes the description of a consumer's exchange, queue and bindings.
mod topology;
pub use self::topology::{ExchangeKind, Topology, TopologyBuilder, TopologyError};

/// Exposes the contract of outbound messages.
mod message;
pub use self::message::{
    CONTENT_TYPE_JSON, DecodeError, EncodeError, Publishable, from_json, to_json,
};

/// Exposes machinery for maintaining a connection to a RabbitMQ broker.
mod connector;
pub use self::connector::dialer::{AmqpDialer, Dialer};
pub use self::connector::state::ConnectionState;
pub use self::connector::{Connector, Gateway, LinkedChannel};

/// Exposes the memoizing declaration of exchanges, queues and bindings.
mod declarator;
pub use self::declarator::{DeclareChannel, Declarator};

/// Exposes the confirmed publisher.
mod publisher;
pub use self::publisher::{PublishMode, Publisher, RepublishHook, RepublishReason};

/// Exposes incoming messages.
mod delivery;
pub use self::delivery::{Delivery, Finalizer};

/// Exposes routing of incoming messages to handlers.
mod multiplexer;
pub use self::multiplexer::{
    DispatchError, DispatchOutcome, DropCallback, FnHandler, Handler, HandlerError, Handlers,
    Multiplexer, TypedHandler, handler_fn, typed_handler,
};

/// Exposes the consumer pool of a single queue.
mod consumer;
pub use self::consumer::{Consumer, Subscription};

/// Exposes the facade tying everything together.
mod worker;
pub use self::worker::{Hooks, Worker};
