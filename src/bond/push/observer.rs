//! Hooks for watching a push session from the outside.

use super::keepalive::KeepaliveError;
use super::session::SessionState;
use std::io;
use std::time::Duration;

/// Receives notifications about a push session.
///
/// Every method has an empty default body and the session never depends on
/// what an observer does.
pub trait SessionObserver: Send + Sync {
    fn state_changed(&self, _from: SessionState, _to: SessionState) {}

    /// A keepalive probe failed and will be retried after `delay`.
    fn keepalive_retry(&self, _attempt: u32, _delay: Duration, _error: &io::Error) {}

    /// A keepalive probe went through after `failures` failed attempts.
    fn keepalive_recovered(&self, _failures: u32) {}

    /// The keepalive retry budget ran out and the session is closing.
    fn keepalive_failed(&self, _error: &KeepaliveError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}
