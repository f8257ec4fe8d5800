//! In-flight runner registry
//!
//! Process-wide map of live runner tasks keyed by workspace id. Each
//! entry carries a cancellation token derived from the process shutdown
//! token plus a completion signal. A cancel only ever signals the
//! runner: the runner task stays the sole writer of its workspace's
//! terminal state, and callers wait on the completion signal to observe
//! it.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct RunnerEntry {
    cancel: CancellationToken,
    finished: CancellationToken,
}

pub struct RunnerRegistry {
    runners: DashMap<i64, RunnerEntry>,
    shutdown: CancellationToken,
}

impl RunnerRegistry {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            runners: DashMap::new(),
            shutdown,
        }
    }

    /// Register a workspace, returning its cancellation token.
    pub fn register(&self, workspace_id: i64) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        self.runners.insert(
            workspace_id,
            RunnerEntry {
                cancel: cancel.clone(),
                finished: CancellationToken::new(),
            },
        );
        debug!("Registered runner for workspace {}", workspace_id);
        cancel
    }

    /// Signal an in-flight runner to cancel. Returns a token that fires
    /// once the runner has persisted its terminal state and exited, or
    /// `None` when no runner is registered for the workspace.
    pub fn cancel(&self, workspace_id: i64) -> Option<CancellationToken> {
        self.runners.get(&workspace_id).map(|entry| {
            entry.cancel.cancel();
            entry.finished.clone()
        })
    }

    /// Drop a finished runner's entry and wake anyone waiting on it.
    pub fn remove(&self, workspace_id: i64) {
        if let Some((_, entry)) = self.runners.remove(&workspace_id) {
            entry.finished.cancel();
        }
    }

    pub fn is_running(&self, workspace_id: i64) -> bool {
        self.runners.contains_key(&workspace_id)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_cancel_remove() {
        let registry = RunnerRegistry::new(CancellationToken::new());
        let token = registry.register(1);

        assert!(registry.is_running(1));
        assert!(!token.is_cancelled());

        let finished = registry.cancel(1).unwrap();
        assert!(token.is_cancelled());
        assert!(!finished.is_cancelled());

        registry.remove(1);
        assert!(finished.is_cancelled());
        assert!(!registry.is_running(1));
        assert!(registry.cancel(1).is_none());
    }

    #[tokio::test]
    async fn test_finished_signal_wakes_waiter() {
        let registry = std::sync::Arc::new(RunnerRegistry::new(CancellationToken::new()));
        registry.register(7);
        let finished = registry.cancel(7).unwrap();

        let waiter = tokio::spawn({
            let finished = finished.clone();
            async move { finished.cancelled().await }
        });
        registry.remove(7);
        waiter.await.unwrap();
    }

    #[test]
    fn test_shutdown_cancels_all_runners() {
        let shutdown = CancellationToken::new();
        let registry = RunnerRegistry::new(shutdown.clone());
        let one = registry.register(1);
        let two = registry.register(2);

        shutdown.cancel();
        assert!(one.is_cancelled());
        assert!(two.is_cancelled());
    }
}
