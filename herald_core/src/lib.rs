#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

// Lets `config_fields!` name this crate by its path from within the crate.
extern crate self as herald_core;

/// Per-worker root cancellation scope.
mod scope;
pub use self::scope::Scope;

/// Spindown registry & tokens.
mod spindown;
pub use self::spindown::token::SpindownToken;
pub use self::spindown::{Spindown, SpindownTimeout};

/// Request-response between asynchronous tasks.
mod conduit;
pub use self::conduit::{Conduit, Retriever};

/// Single-release barriers.
mod latch;
pub use self::latch::{Gate, Latch};

/// Exponential retry pacing with an attempt limit.
mod backoff;
pub use self::backoff::config::BackoffConfig;
pub use self::backoff::{Backoff, BackoffExhausted};

/// Ambient correlation id, carried in a task-local scope.
mod correlation;
pub use self::correlation::CorrelationId;

/// Lenient matching of configuration keys.
mod keys;
pub use self::keys::keys_match;

#[doc(hidden)]
pub mod __private {
    pub use humantime;
    pub use serde;
}
