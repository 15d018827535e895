use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The root cancellation scope of a single worker.
///
/// A scope starts alive and may be [cancelled](Scope::cancel) at any time;
/// cancelling is one-way and repeated cancellation produces no additional
/// effect. Background tasks [wait](Scope::cancelled) on the scope next to
/// their actual work and unwind once it is cancelled.
///
/// [Child scopes](Scope::child) are cancelled together with their parent, but
/// cancelling a child leaves the parent alive. This lets a component (e.g., a
/// publisher) be closed on its own while still following the worker's root
/// scope.
///
/// Unlike a process-wide context, every worker owns its own scope, so any
/// number of workers can live side by side in one process.
#[derive(Debug, Clone)]
pub struct Scope {
    name: Arc<str>,
    token: CancellationToken,
}

impl Scope {
    /// Creates a new, alive root scope with the given human-readable name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            token: CancellationToken::new(),
        }
    }

    /// Derives a child scope that is cancelled whenever this scope is.
    pub fn child(&self, name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(format!("{}/{}", self.name, name.as_ref())),
            token: self.token.child_token(),
        }
    }

    /// Reports the name of this scope.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exposes the underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Scope {
    /// Waits until this scope is cancelled. Completes immediately if it
    /// already is.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Cancels this scope and all of its children.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!(scope = self.name.as_ref(), "Cancelling scope");
        }

        self.token.cancel();
    }

    /// Reports whether this scope has been cancelled as of this moment.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_propagates_to_children() {
        // Given
        let root = Scope::new("worker");
        let child = root.child("publisher");

        // When
        root.cancel();

        // Then
        assert!(root.is_cancelled());
        assert!(child.is_cancelled());
        tokio::time::timeout(Duration::from_millis(50), child.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_does_not_propagate_to_parent() {
        // Given
        let root = Scope::new("worker");
        let child = root.child("publisher");

        // When
        child.cancel();
        child.cancel();

        // Then
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn child_name() {
        // Given
        let root = Scope::new("worker");

        // When
        let child = root.child("consumer");

        // Then
        assert_eq!(child.name(), "worker/consumer");
    }
}
