//! A single BPUP subscription to a bridge.
//!
//! A session is opened against the bridge's push port, performs a one-probe
//! handshake, then keeps the subscription alive from a background task while
//! the owner pulls updates with [`PushSession::receive`].

use super::PROBE;
use super::keepalive::{self, KeepalivePolicy, ProbeTransport};
use super::observer::{NoopObserver, SessionObserver};
use super::signal::{ShutdownReason, ShutdownSignal};
use super::update::{DecodeError, Update};
use log::{debug, info};
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Largest handshake reply read, in bytes.
const HANDSHAKE_BUFFER_SIZE: usize = 256;

/// Largest update datagram read, in bytes. Longer datagrams are truncated.
const UPDATE_BUFFER_SIZE: usize = 512;

/// Lifecycle of a push session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Handshaking,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long to wait for the bridge to answer the handshake probe.
    pub handshake_timeout: Duration,
    pub keepalive: KeepalivePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            keepalive: KeepalivePolicy::default(),
        }
    }
}

/// Failure to establish a push session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("error resolving bridge address {address:?}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("bridge address {0:?} did not resolve to any socket address")]
    Unresolved(String),

    #[error("error opening connection: {0}")]
    Transport(#[source] io::Error),

    #[error("error sending initial message to bridge: {0}")]
    Send(#[source] io::Error),

    #[error("error reading handshake response from bridge: {0}")]
    Recv(#[source] io::Error),

    #[error("no handshake response from bridge within {0:?}")]
    NoReply(Duration),
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("no update received within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("push session is closed")]
    Closed,

    #[error("push session is not active (state {0:?})")]
    NotActive(SessionState),

    #[error("cannot start push session in state {0:?}")]
    InvalidState(SessionState),

    #[error("error receiving from bridge: {0}")]
    Io(#[from] io::Error),
}

/// Session state reachable from the failure watcher without owning the
/// session.
struct Shared {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    state: Mutex<SessionState>,
}

impl Shared {
    /// Move to `Closed` and release the socket. Returns the state that was
    /// left, or `None` if the session was already closed.
    fn teardown(&self) -> Option<SessionState> {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Closed);
        drop(self.socket.lock().take());
        (previous != SessionState::Closed).then_some(previous)
    }
}

/// Push feed from one Bond bridge.
///
/// All operations take `&self`, so one task can block in [`receive`] while
/// another calls [`close`].
///
/// [`receive`]: PushSession::receive
/// [`close`]: PushSession::close
pub struct PushSession {
    peer: SocketAddr,
    local: SocketAddr,
    config: SessionConfig,
    shared: Arc<Shared>,
    signal: ShutdownSignal,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    observer: Arc<dyn SessionObserver>,
    /// Keepalive target; the session socket when unset.
    probe: Option<Arc<dyn ProbeTransport>>,
}

impl PushSession {
    /// Resolve `address` (`host:port`) and open a UDP socket connected to it.
    ///
    /// The session is left in [`SessionState::Created`]; call [`start`] to
    /// handshake.
    ///
    /// [`start`]: PushSession::start
    pub async fn connect(address: &str, config: SessionConfig) -> Result<Self, HandshakeError> {
        let peer = tokio::net::lookup_host(address)
            .await
            .map_err(|source| HandshakeError::Resolve {
                address: address.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| HandshakeError::Unresolved(address.to_string()))?;

        let bind_addr: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(HandshakeError::Transport)?;
        socket
            .connect(peer)
            .await
            .map_err(HandshakeError::Transport)?;
        let local = socket.local_addr().map_err(HandshakeError::Transport)?;

        info!(
            "[BPUP] Opened UDP connection to {} listening at {}",
            peer, local
        );

        Ok(Self {
            peer,
            local,
            config,
            shared: Arc::new(Shared {
                socket: Mutex::new(Some(Arc::new(socket))),
                state: Mutex::new(SessionState::Created),
            }),
            signal: ShutdownSignal::new(),
            keepalive: Mutex::new(None),
            observer: Arc::new(NoopObserver),
            probe: None,
        })
    }

    /// Connect, handshake and arm the keepalive in one step.
    ///
    /// On failure the half-open session is closed before returning.
    pub async fn open(address: &str, config: SessionConfig) -> Result<Self, PushError> {
        let session = Self::connect(address, config).await?;
        if let Err(e) = session.start().await {
            session.close();
            return Err(e);
        }
        Ok(session)
    }

    /// Attach an observer. Only meaningful before [`start`](PushSession::start).
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_probe_transport(mut self, probe: Arc<dyn ProbeTransport>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Handshake with the bridge and arm the keepalive task.
    ///
    /// Any datagram received within the handshake timeout counts as the
    /// bridge's acknowledgement; its content is only logged.
    pub async fn start(&self) -> Result<(), PushError> {
        {
            let mut state = self.shared.state.lock();
            if *state != SessionState::Created {
                return Err(PushError::InvalidState(*state));
            }
            *state = SessionState::Handshaking;
        }
        self.observer
            .state_changed(SessionState::Created, SessionState::Handshaking);

        let socket = self.shared.socket.lock().clone().ok_or(PushError::Closed)?;
        self.handshake(&socket).await?;

        {
            let mut state = self.shared.state.lock();
            if *state != SessionState::Handshaking || self.signal.is_raised() {
                return Err(PushError::Closed);
            }
            *state = SessionState::Active;
        }
        self.observer
            .state_changed(SessionState::Handshaking, SessionState::Active);

        let handle = match &self.probe {
            Some(probe) => keepalive::spawn(
                probe.clone(),
                self.config.keepalive,
                self.signal.clone(),
                self.observer.clone(),
            ),
            None => keepalive::spawn(
                socket,
                self.config.keepalive,
                self.signal.clone(),
                self.observer.clone(),
            ),
        };
        *self.keepalive.lock() = Some(handle);
        self.watch_keepalive_failure();

        info!("[BPUP] Push session to {} is active", self.peer);
        Ok(())
    }

    /// Close the session once the keepalive gives up. Holds only a weak
    /// reference, so a dropped session is not kept alive.
    fn watch_keepalive_failure(&self) {
        let shared = Arc::downgrade(&self.shared);
        let signal = self.signal.clone();
        let observer = self.observer.clone();
        let peer = self.peer;

        tokio::spawn(async move {
            if !signal.raised().await.is_failure() {
                return;
            }
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if let Some(previous) = shared.teardown() {
                info!(
                    "[BPUP] Closed push session to {} after keepalive failure",
                    peer
                );
                observer.state_changed(previous, SessionState::Closed);
            }
        });
    }

    async fn handshake(&self, socket: &UdpSocket) -> Result<(), PushError> {
        socket.send(PROBE).await.map_err(HandshakeError::Send)?;

        let mut buf = [0u8; HANDSHAKE_BUFFER_SIZE];
        let timeout = self.config.handshake_timeout;
        let len = tokio::select! {
            biased;
            _ = self.signal.cancelled() => return Err(PushError::Closed),
            read = tokio::time::timeout(timeout, socket.recv(&mut buf)) => match read {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => return Err(HandshakeError::Recv(e).into()),
                Err(_) => return Err(HandshakeError::NoReply(timeout).into()),
            },
        };

        info!(
            "[BPUP] Received handshake response from bridge: {:?}",
            String::from_utf8_lossy(&buf[..len])
        );
        Ok(())
    }

    /// Wait up to `timeout` for one datagram and decode it.
    ///
    /// [`PushError::Timeout`] and [`PushError::Decode`] are recoverable;
    /// [`PushError::Closed`] means the session is gone and the caller should
    /// stop receiving. No-op updates (handshake or keepalive echoes) are
    /// returned like any other update.
    pub async fn receive(&self, timeout: Duration) -> Result<Update, PushError> {
        let socket = self.active_socket()?;

        let mut buf = [0u8; UPDATE_BUFFER_SIZE];
        let len = tokio::select! {
            biased;
            _ = self.signal.cancelled() => return Err(PushError::Closed),
            read = tokio::time::timeout(timeout, socket.recv(&mut buf)) => match read {
                Ok(Ok(len)) => len,
                Ok(Err(_)) if self.signal.is_raised() => return Err(PushError::Closed),
                Ok(Err(e)) => return Err(PushError::Io(e)),
                Err(_) => return Err(PushError::Timeout(timeout)),
            },
        };

        let datagram = &buf[..len];
        debug!(
            "[BPUP] Received UDP message from bridge: {:?}",
            String::from_utf8_lossy(datagram)
        );
        Ok(Update::decode(datagram)?)
    }

    fn active_socket(&self) -> Result<Arc<UdpSocket>, PushError> {
        match self.state() {
            SessionState::Active => {}
            SessionState::Closed => return Err(PushError::Closed),
            other => return Err(PushError::NotActive(other)),
        }
        self.shared.socket.lock().clone().ok_or(PushError::Closed)
    }

    /// Stop the keepalive task and release the socket.
    ///
    /// Safe to call more than once and from any state. A blocked
    /// [`receive`](PushSession::receive) returns [`PushError::Closed`].
    pub fn close(&self) {
        self.signal.raise(ShutdownReason::Stopped);
        if let Some(previous) = self.shared.teardown() {
            info!("[BPUP] Closed push session to {}", self.peer);
            self.observer.state_changed(previous, SessionState::Closed);
        }
    }

    /// Resolve once the session has been closed, by [`close`] or by a
    /// keepalive failure, and report which.
    ///
    /// [`close`]: PushSession::close
    pub async fn closed(&self) -> ShutdownReason {
        self.signal.raised().await
    }

    /// Why the session closed, if it has.
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.signal.reason()
    }

    /// Current state. A session whose keepalive has failed reads as closed.
    pub fn state(&self) -> SessionState {
        if self.signal.is_raised() {
            SessionState::Closed
        } else {
            *self.shared.state.lock()
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for PushSession {
    fn drop(&mut self) {
        self.signal.raise(ShutdownReason::Stopped);
        if let Some(handle) = self.keepalive.lock().take() {
            debug!(
                "[BPUP] Dropping push session to {} (keepalive finished: {})",
                self.peer,
                handle.is_finished()
            );
        }
    }
}
