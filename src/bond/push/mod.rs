//! Bond Push UDP Protocol (BPUP) client.
//!
//! The bridge pushes device state as JSON datagrams to any client that has
//! sent it a probe recently. [`PushSession`] owns that exchange: handshake,
//! periodic keepalive with bounded retry, and decoding of inbound updates.

mod keepalive;
mod observer;
mod session;
mod signal;
mod update;

#[cfg(test)]
pub(crate) mod test_peer;

pub use keepalive::{Backoff, KeepaliveError, KeepalivePolicy, ProbeTransport};
pub use observer::{NoopObserver, SessionObserver};
pub use session::{HandshakeError, PushError, PushSession, SessionConfig, SessionState};
pub use signal::{ShutdownReason, ShutdownSignal};
pub use update::{DecodeError, HttpMethod, Update, UpdateKind};

/// Probe sent for both the handshake and every keepalive.
pub const PROBE: &[u8] = b"\n";

/// UDP port a bridge accepts BPUP subscriptions on.
pub const BPUP_PORT: u16 = 30007;
