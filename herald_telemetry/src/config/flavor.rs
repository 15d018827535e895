use serde::Deserialize;

/// Selects the event formatter of the logging layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatFlavor {
    /// The default single-line [`Full`](tracing_subscriber::fmt::format::Full) format.
    #[default]
    #[serde(alias = "default")]
    Full,

    /// The [`Compact`](tracing_subscriber::fmt::format::Compact) format.
    Compact,

    /// The multi-line [`Pretty`](tracing_subscriber::fmt::format::Pretty) format.
    Pretty,

    /// The [`Json`](tracing_subscriber::fmt::format::Json) format.
    #[cfg(feature = "json")]
    Json,
}
