//! Registry of named background tasks joined at shutdown.

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::NodeLifetime;

/// Owns the node's background tasks.
///
/// Each task receives the shared [`NodeLifetime`]; `shutdown` triggers
/// it and joins everything, logging tasks that ended by panic.
pub struct TaskSet {
    lifetime: NodeLifetime,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskSet {
    pub fn new(lifetime: NodeLifetime) -> Self {
        Self {
            lifetime,
            tasks: Vec::new(),
        }
    }

    pub fn lifetime(&self) -> &NodeLifetime {
        &self.lifetime
    }

    /// Spawn a named task. The future receives a lifetime clone and is
    /// expected to return promptly once it triggers.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce(NodeLifetime) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "starting background task");
        let handle = tokio::spawn(f(self.lifetime.clone()));
        self.tasks.push((name, handle));
    }

    /// Trigger the lifetime and join every task.
    pub async fn shutdown(self) {
        self.lifetime.trigger();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => debug!(task = name, "task finished"),
                Err(err) if err.is_panic() => {
                    warn!(task = name, "task panicked during shutdown")
                }
                Err(_) => debug!(task = name, "task aborted"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn tasks_observe_shutdown() {
        let mut tasks = TaskSet::new(NodeLifetime::new());
        let cleaned = Arc::new(AtomicBool::new(false));

        let flag = cleaned.clone();
        tasks.spawn("ticker", move |lifetime| async move {
            lifetime.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        assert_eq!(tasks.len(), 1);
        tasks.shutdown().await;
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
