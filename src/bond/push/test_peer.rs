//! Loopback stand-in for a bridge's BPUP port, for tests.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) struct TestPeer {
    socket: Arc<UdpSocket>,
    client: Arc<Mutex<Option<SocketAddr>>>,
    received: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<()>,
}

impl TestPeer {
    /// Start a peer that answers each inbound datagram with whatever
    /// `handler` returns.
    pub(crate) async fn start<F>(mut handler: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = Arc::new(Mutex::new(None));
        let (tx, received) = mpsc::unbounded_channel();

        let task = {
            let socket = socket.clone();
            let client = client.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                        continue;
                    };
                    *client.lock() = Some(from);
                    let message = String::from_utf8_lossy(&buf[..len]).into_owned();
                    let reply = handler(&message);
                    if tx.send(message).is_err() {
                        return;
                    }
                    if let Some(reply) = reply {
                        let _ = socket.send_to(reply.as_bytes(), from).await;
                    }
                }
            })
        };

        Self {
            socket,
            client,
            received,
            task,
        }
    }

    /// A peer that answers the first datagram with `reply` and then stays quiet.
    pub(crate) async fn replying_once(reply: &str) -> Self {
        let mut reply = Some(reply.to_string());
        Self::start(move |_| reply.take()).await
    }

    /// A peer that never answers.
    pub(crate) async fn silent() -> Self {
        Self::start(|_| None).await
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub(crate) fn address(&self) -> String {
        self.local_addr().to_string()
    }

    /// Next datagram received from the client, if one arrives in time.
    pub(crate) async fn next_message(&mut self, within: Duration) -> Option<String> {
        tokio::time::timeout(within, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Send an unsolicited datagram to the last client heard from.
    pub(crate) async fn push(&self, payload: &str) {
        let client = (*self.client.lock()).expect("no client has contacted the peer yet");
        self.socket
            .send_to(payload.as_bytes(), client)
            .await
            .unwrap();
    }
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
