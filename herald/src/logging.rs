use crate::config::error::TracingInitError;
use herald_telemetry::{Registry, SubscriberExt, SubscriberInitExt, TracingConfig, make_layer};
use tracing_log::LogTracer;

/// Installs the formatted layer described by the given config as the global
/// subscriber, and forwards `log` records to it.
///
/// Fails if a global subscriber or logger is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TracingInitError> {
    Registry::default().with(make_layer(config)).try_init()?;
    LogTracer::init()?;

    tracing::debug!(
        verbosity = ?config.verbosity(),
        flavor = ?config.flavor(),
        "Installed the tracing subscriber",
    );

    Ok(())
}
