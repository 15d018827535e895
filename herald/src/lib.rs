#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Implements the [`AppConfig`] and its sources.
mod config;
pub use self::config::AppConfig;
pub use self::config::assembler::{AssemblerChoices, ENV_CONFIG_DIR, ENV_PROFILE, make_builder};
pub use self::config::error::{AppConfigError, TracingInitError};
pub use self::config::scanner::{ConfigFile, find_config_files};

/// Implements the [`DotEnv`] loader.
mod dotenv;
pub use self::dotenv::DotEnv;

/// Implements the global logging setup.
mod logging;
pub use self::logging::init_tracing;

/// Re-exports the public API of `herald-core` in the root of this crate for
/// convenience.
pub use herald_core::*;

/// Re-exports the public API of `herald-rabbitmq` in the root of this crate
/// for convenience.
pub use herald_rabbitmq::*;

/// Re-exports the public API of `herald-telemetry` for convenience.
pub use herald_telemetry as telemetry;
