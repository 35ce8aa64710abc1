//! One-shot readiness signal

use crate::error::{McpCheckError, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Signals that a proxy's listener is bound
///
/// Any number of waiters are released together; waiting after the signal
/// fired returns immediately.
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal; returns `true` only for the call that fired it
    pub fn mark_ready(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until ready or until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns [`McpCheckError::Cancelled`] if cancelled first.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return Ok(());
        }

        tokio::select! {
            biased;
            result = rx.wait_for(|ready| *ready) => {
                // the sender lives in `self`, so the channel cannot close here
                result.map(|_| ()).map_err(|_| McpCheckError::Cancelled)
            }
            _ = cancel.cancelled() => Err(McpCheckError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mark_ready_fires_once() {
        let readiness = Readiness::new();
        assert!(!readiness.is_ready());
        assert!(readiness.mark_ready());
        assert!(!readiness.mark_ready());
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_wait_after_ready_returns_immediately() {
        let readiness = Readiness::new();
        readiness.mark_ready();

        let cancel = CancellationToken::new();
        cancel.cancel();
        // already ready wins over an already-cancelled token
        readiness.wait_ready(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiters_released_together() {
        let readiness = Readiness::new();
        let cancel = CancellationToken::new();

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let readiness = readiness.clone();
            let cancel = cancel.clone();
            waiters.push(tokio::spawn(async move { readiness.wait_ready(&cancel).await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        for waiter in &waiters {
            assert!(!waiter.is_finished());
        }

        readiness.mark_ready();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancel_before_ready() {
        let readiness = Readiness::new();
        let cancel = CancellationToken::new();

        let waiter = {
            let readiness = readiness.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { readiness.wait_ready(&cancel).await })
        };

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(McpCheckError::Cancelled)));
    }
}
