use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT: CorrelationId;
}

/// The correlation id of the request currently being served.
///
/// A request entrypoint (webhook intake, message handler) runs its work
/// [within a scope](CorrelationId::scope); anything deeper down the same task
/// [extracts](CorrelationId::extract) the id without threading it through
/// every call. Outside of any scope the extracted id is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Wraps the given string as a correlation id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Runs the given future with this id as the ambient correlation id.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, future).await
    }

    /// Returns the ambient correlation id, or an empty one outside of any
    /// [scope](CorrelationId::scope).
    pub fn extract() -> Self {
        CURRENT.try_with(CorrelationId::clone).unwrap_or_default()
    }

    /// Exposes the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reports whether the id is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}
