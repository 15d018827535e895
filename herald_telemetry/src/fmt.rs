use crate::{FormatFlavor, TracingConfig};
use tracing_core::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::fmt::format::Format;
use tracing_subscriber::registry::LookupSpan;

/// Boxes a fully configured formatted layer, dropping the timer when the
/// config hides timestamps. Both arms have different concrete types, hence
/// the macro.
macro_rules! boxed_layer {
    ($layer:expr, $config:expr, $targets:expr) => {{
        let layer = configure($layer, $config);

        if $config.parts().timestamp {
            Box::new(layer.with_filter($targets)) as Box<dyn Layer<S> + Send + Sync>
        } else {
            Box::new(layer.without_time().with_filter($targets))
        }
    }};
}

/// Builds the formatted `tracing` layer described by the given
/// [config](TracingConfig), filtered by its root and per-target verbosity.
pub fn make_layer<S>(config: impl AsRef<TracingConfig>) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let config = config.as_ref();
    let targets = Targets::new()
        .with_default(config.verbosity())
        .with_targets(config.targets());

    match config.flavor() {
        FormatFlavor::Full => boxed_layer!(FmtLayer::<S>::new(), config, targets),
        FormatFlavor::Compact => boxed_layer!(FmtLayer::<S>::new().compact(), config, targets),
        FormatFlavor::Pretty => boxed_layer!(FmtLayer::<S>::new().pretty(), config, targets),
        #[cfg(feature = "json")]
        FormatFlavor::Json => {
            boxed_layer!(FmtLayer::<S>::new().json().with_ansi(false), config, targets)
        }
    }
}

fn configure<S, N, L, T, W>(
    layer: FmtLayer<S, N, Format<L, T>, W>,
    config: &TracingConfig,
) -> FmtLayer<S, N, Format<L, T>, W>
where
    N: for<'writer> FormatFields<'writer> + 'static,
{
    let parts = config.parts();
    let layer = if config.color() {
        layer
    } else {
        layer.with_ansi(false)
    };

    layer
        .with_target(parts.target)
        .with_file(parts.file)
        .with_line_number(parts.line_number)
        .with_level(parts.level)
        .with_thread_ids(parts.thread_id)
        .with_thread_names(parts.thread_name)
}
