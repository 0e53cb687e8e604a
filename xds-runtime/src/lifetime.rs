//! Cancellation token shared by every background task.

use tokio::sync::watch;

use crate::Cancelled;

/// Cloneable shutdown token.
///
/// Every background loop selects on [`NodeLifetime::cancelled`] next
/// to its own work; once [`NodeLifetime::trigger`] fires, loops run
/// their cleanup and return.
#[derive(Debug, Clone)]
pub struct NodeLifetime {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl NodeLifetime {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Begin shutdown. Idempotent.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// `true` once shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Suspend until shutdown is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();

        loop {
            if *receiver.borrow() {
                return;
            }

            if receiver.changed().await.is_err() {
                // all senders gone counts as shutdown
                return;
            }
        }
    }

    /// Fail fast when shutdown has been requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_triggered() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for NodeLifetime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_releases_waiters() {
        let lifetime = NodeLifetime::new();
        let waiter = lifetime.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        assert!(!lifetime.is_triggered());
        lifetime.trigger();

        assert!(handle.await.unwrap());
        assert!(lifetime.check().is_err());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_after_trigger() {
        let lifetime = NodeLifetime::new();
        lifetime.trigger();
        lifetime.cancelled().await;
    }
}
