//! In-process channels. Used to run a client against a scripted peer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use netfs_types::NetAddress;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::channel::Channel;
use crate::connection::{Connection, Connector};
use crate::error::NetError;

pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: watch::Sender<bool>,
}

impl MemoryChannel {
    /// Two ends of one stream. Closing either end fails the other's reads.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: watch::channel(false).0,
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, payload: Bytes) -> Result<(), NetError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(NetError::ConnectionClosed)?;
        tx.send(payload).map_err(|_| NetError::ConnectionClosed)
    }

    async fn receive(&self) -> Result<Bytes, NetError> {
        let mut closed = self.closed.subscribe();
        let recv = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        tokio::select! {
            msg = recv => msg.ok_or(NetError::ConnectionClosed),
            _ = closed.wait_for(|c| *c) => Err(NetError::ConnectionClosed),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.tx.lock().take();
    }

    fn description(&self) -> String {
        "memory".to_string()
    }
}

fn arcs(channels: Vec<MemoryChannel>) -> Vec<Arc<dyn Channel>> {
    channels
        .into_iter()
        .map(|c| Arc::new(c) as Arc<dyn Channel>)
        .collect()
}

/// A connected client/peer pair of connections.
///
/// The peer's upstream channels are the far ends of the client's downstream
/// channels, so whatever the peer sends there shows up on the client's
/// reader tasks.
pub fn connection_pair(upstream: usize, downstream: usize) -> (Connection, Connection) {
    let (client_up, peer_down): (Vec<_>, Vec<_>) =
        (0..upstream).map(|_| MemoryChannel::pair()).unzip();
    let (client_down, peer_up): (Vec<_>, Vec<_>) =
        (0..downstream).map(|_| MemoryChannel::pair()).unzip();
    (
        Connection::new(arcs(client_up), arcs(client_down)),
        Connection::new(arcs(peer_up), arcs(peer_down)),
    )
}

/// Connector that hands the peer half of every new connection to a receiver.
pub struct MemoryConnector {
    upstream: usize,
    downstream: usize,
    peers: mpsc::UnboundedSender<(NetAddress, Connection)>,
}

impl MemoryConnector {
    pub fn new(
        upstream: usize,
        downstream: usize,
    ) -> (Self, mpsc::UnboundedReceiver<(NetAddress, Connection)>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                upstream,
                downstream,
                peers,
            },
            rx,
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, addr: NetAddress) -> Result<Connection, NetError> {
        let (client, peer) = connection_pair(self.upstream, self.downstream);
        self.peers
            .send((addr, peer))
            .map_err(|_| NetError::ConnectFailed {
                addr: addr.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            })?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_pair_is_duplex() {
        let (a, b) = MemoryChannel::pair();
        a.send(Bytes::from_static(b"to b")).await.unwrap();
        b.send(Bytes::from_static(b"to a")).await.unwrap();
        assert_eq!(&b.receive().await.unwrap()[..], b"to b");
        assert_eq!(&a.receive().await.unwrap()[..], b"to a");
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (a, _b) = MemoryChannel::pair();
        let a = Arc::new(a);
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.close().await;
        let res = reader.await.unwrap();
        assert!(matches!(res, Err(NetError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_peer_close_ends_stream() {
        let (a, b) = MemoryChannel::pair();
        b.close().await;
        assert!(matches!(a.receive().await, Err(NetError::ConnectionClosed)));
        assert!(matches!(
            b.send(Bytes::from_static(b"x")).await,
            Err(NetError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connection_pair_routing() {
        let (client, peer) = connection_pair(1, 1);
        let up = client.upstream_channel().await.unwrap();
        up.channel().send(Bytes::from_static(b"call")).await.unwrap();
        assert_eq!(&peer.downstream_channels()[0].receive().await.unwrap()[..], b"call");

        let push = peer.upstream_channel().await.unwrap();
        push.channel().send(Bytes::from_static(b"event")).await.unwrap();
        assert_eq!(&client.downstream_channels()[0].receive().await.unwrap()[..], b"event");
    }
}
