//! One-shot shutdown signal shared by a push session and its keepalive task.

use super::keepalive::KeepaliveError;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Why a push session stopped.
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// The owner closed or dropped the session.
    Stopped,
    /// The keepalive retry budget ran out; the bridge will drop the feed.
    KeepaliveFailed(Arc<KeepaliveError>),
}

impl ShutdownReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, ShutdownReason::KeepaliveFailed(_))
    }
}

/// Cancellation token that remembers the first reason it was raised with.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns false if it was already raised, in which
    /// case the original reason is kept.
    pub fn raise(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    /// Wait until the signal is raised.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Wait until the signal is raised and return why.
    pub async fn raised(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    fn keepalive_failure() -> ShutdownReason {
        ShutdownReason::KeepaliveFailed(Arc::new(KeepaliveError::RetryBudgetExhausted {
            budget: Duration::from_secs(120),
            elapsed: Duration::from_secs(63),
            attempts: 7,
            last_error: io::Error::from(io::ErrorKind::ConnectionRefused),
        }))
    }

    #[test]
    fn test_first_reason_wins() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_raised());
        assert!(signal.reason().is_none());

        assert!(signal.raise(ShutdownReason::Stopped));
        assert!(!signal.raise(keepalive_failure()));

        assert!(signal.is_raised());
        assert!(!signal.reason().unwrap().is_failure());
    }

    #[tokio::test]
    async fn test_clones_observe_raise() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();

        let waiter = tokio::spawn(async move { observer.raised().await });
        signal.raise(keepalive_failure());

        let reason = waiter.await.unwrap();
        assert!(reason.is_failure());
    }
}
