use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Process-wide shutdown scope.
///
/// Created once at startup and handed to every component that dials or relays. Firing it aborts
/// in-flight dials and tears down every running session; it never un-accepts a handshake that was
/// already resolved.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    token: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the shutdown signal. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("lifecycle shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// A token cancelled with this scope, or earlier by its own holder.
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::Lifecycle;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_reaches_clones_and_children() {
        let lifecycle = Lifecycle::new();
        let clone = lifecycle.clone();
        let child = lifecycle.child();

        let waiter = tokio::spawn(async move { clone.cancelled().await });
        lifecycle.shutdown();
        lifecycle.shutdown();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(child.is_cancelled());
        assert!(lifecycle.is_shutting_down());
    }

    #[test]
    fn cancelling_a_child_leaves_the_scope_running() {
        let lifecycle = Lifecycle::new();
        let child = lifecycle.child();
        child.cancel();
        assert!(!lifecycle.is_shutting_down());
    }
}
