use serde::Deserialize;
use tracing_core::LevelFilter;

/// A deserializable stand-in for the `tracing` [`LevelFilter`].
///
/// A level is "higher" when it is more verbose: [`Trace`](Verbosity::Trace) is
/// the highest, [`Off`](Verbosity::Off) the lowest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Log nothing.
    #[serde(alias = "no", alias = "none", alias = "OFF")]
    Off,

    /// Errors only.
    #[serde(alias = "err", alias = "ERROR")]
    Error,

    /// Warnings and errors.
    #[serde(alias = "warning", alias = "WARN")]
    Warn,

    /// Informational events and lower.
    #[default]
    #[serde(alias = "INFO")]
    Info,

    /// Debug events and lower.
    #[serde(alias = "DEBUG")]
    Debug,

    /// Everything.
    #[serde(alias = "TRACE")]
    Trace,
}

impl Verbosity {
    /// Translates this verbosity to the `tracing` [`LevelFilter`].
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

impl From<Verbosity> for LevelFilter {
    fn from(value: Verbosity) -> Self {
        value.to_level_filter()
    }
}

impl From<&Verbosity> for LevelFilter {
    fn from(value: &Verbosity) -> Self {
        value.to_level_filter()
    }
}
