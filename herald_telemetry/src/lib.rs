#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Implements the [`TracingConfig`] configuration section.
mod config;
pub use self::config::{EventParts, TracingConfig};
pub use self::config::flavor::FormatFlavor;
pub use self::config::verbosity::Verbosity;

/// Implements the formatted `tracing` layer.
mod fmt;
pub use self::fmt::make_layer;

/// Leveled logger interface and the line-prefix adapter.
mod logger;
pub use self::logger::{Logger, PrefixAdapter, TracingLogger, split_level_prefix};

/// Release metrics.
mod metrics;
pub use self::metrics::{MetricsError, RELEASE_LABELS, ReleaseLabels, ReleaseMetrics};

/// Partly re-exports the public API of `tracing_*` for convenience.
pub use tracing_core::Subscriber;
pub use tracing_subscriber::Registry;
pub use tracing_subscriber::layer::SubscriberExt;
pub use tracing_subscriber::util::SubscriberInitExt;
