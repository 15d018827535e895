use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::string::FromUtf8Error;
use thiserror::Error;

/// The label names of the release counter, in order.
pub const RELEASE_LABELS: [&str; 5] = ["environment", "service", "releaser", "intent", "squad"];

/// One combination of [release counter](ReleaseMetrics) labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ReleaseLabels {
    /// Target environment, e.g. `production`.
    pub environment: String,
    /// Released service.
    pub service: String,
    /// Who (or what) triggered the release.
    pub releaser: String,
    /// Promote, release, rollback, etc.
    pub intent: String,
    /// Owning squad.
    pub squad: String,
}

impl ReleaseLabels {
    fn values(&self) -> [&str; 5] {
        [
            &self.environment,
            &self.service,
            &self.releaser,
            &self.intent,
            &self.squad,
        ]
    }
}

/// Counts released events, and the broker traffic carrying them, on a private
/// Prometheus [`Registry`].
///
/// Besides `<namespace>_released_total`, the registry holds:
///
/// - `<namespace>_published_total{kind}`: messages the broker confirmed;
/// - `<namespace>_republished_total{reason}`: messages sent again;
/// - `<namespace>_deliveries_total{kind, outcome}`: settled deliveries.
#[derive(Clone)]
pub struct ReleaseMetrics {
    released: IntCounterVec,
    published: IntCounterVec,
    republished: IntCounterVec,
    deliveries: IntCounterVec,
    registry: Registry,
}

/// Failure to register or render the release metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The Prometheus client rejected an operation.
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// The rendered exposition was not valid UTF-8.
    #[error("rendered metrics are not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

impl ReleaseMetrics {
    /// Creates and registers all counters under the given namespace.
    pub fn new(namespace: impl Into<String>) -> Result<Self, MetricsError> {
        let namespace = namespace.into();
        let registry = Registry::new();
        let counter = |name: &str, help: &str, labels: &[&str]| {
            let counter =
                IntCounterVec::new(Opts::new(name, help).namespace(namespace.as_str()), labels)?;
            registry.register(Box::new(counter.clone()))?;

            Ok::<_, MetricsError>(counter)
        };

        let released = counter("released_total", "Total released events", &RELEASE_LABELS)?;
        let published = counter(
            "published_total",
            "Messages confirmed by the broker",
            &["kind"],
        )?;
        let republished = counter(
            "republished_total",
            "Messages sent to the broker again",
            &["reason"],
        )?;
        let deliveries = counter(
            "deliveries_total",
            "Incoming messages settled with the broker",
            &["kind", "outcome"],
        )?;

        Ok(Self {
            released,
            published,
            republished,
            deliveries,
            registry,
        })
    }

    /// Counts one released event.
    pub fn record(&self, labels: &ReleaseLabels) {
        self.released.with_label_values(&labels.values()).inc();
    }

    /// The current count for the given label combination.
    pub fn count(&self, labels: &ReleaseLabels) -> u64 {
        self.released.with_label_values(&labels.values()).get()
    }

    /// Counts one message of the given type confirmed by the broker.
    pub fn record_published(&self, kind: &str) {
        self.published.with_label_values(&[kind]).inc();
    }

    /// Counts one message sent again for the given reason.
    pub fn record_republish(&self, reason: &str) {
        self.republished.with_label_values(&[reason]).inc();
    }

    /// Counts one delivery of the given type settled with the given outcome.
    pub fn record_delivery(&self, kind: &str, outcome: &str) {
        self.deliveries.with_label_values(&[kind, outcome]).inc();
    }

    /// The current count of confirmed messages of the given type.
    pub fn published(&self, kind: &str) -> u64 {
        self.published.with_label_values(&[kind]).get()
    }

    /// The current count of messages sent again for the given reason.
    pub fn republished(&self, reason: &str) -> u64 {
        self.republished.with_label_values(&[reason]).get()
    }

    /// The current count of deliveries of the given type and outcome.
    pub fn deliveries(&self, kind: &str, outcome: &str) -> u64 {
        self.deliveries.with_label_values(&[kind, outcome]).get()
    }

    /// The private registry, for mounting into an exposition endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }
}
