use config::ConfigError;
use thiserror::Error;

/// Failure to assemble or interpret the application configuration.
#[derive(Debug, Error)]
pub enum AppConfigError {
    /// A source could not be read or parsed.
    #[error("failed to assemble the application configuration: {0}")]
    Assemble(#[source] ConfigError),

    /// The assembled configuration does not describe a valid [`AppConfig`].
    ///
    /// [`AppConfig`]: crate::AppConfig
    #[error("invalid application configuration: {0}")]
    Invalid(#[source] ConfigError),
}

/// Failure to install the global logging setup.
#[derive(Debug, Error)]
pub enum TracingInitError {
    /// Another global subscriber was installed first.
    #[error("a global tracing subscriber is already installed: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),

    /// Another global `log` logger was installed first.
    #[error("a global log logger is already installed: {0}")]
    Logger(#[from] tracing_log::log::SetLoggerError),
}
