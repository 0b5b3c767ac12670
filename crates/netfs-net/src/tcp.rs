//! Framed TCP channels.
//!
//! The stream is split into halves behind separate async mutexes, so one
//! task can block in `receive` while another sends.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use netfs_types::NetAddress;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};

use crate::channel::Channel;
use crate::connection::{Connection, Connector};
use crate::error::NetError;
use crate::message::{MESSAGE_HEADER_SIZE, MessageHeader, encode_frame};

pub struct TcpChannel {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
    peer: NetAddress,
}

impl TcpChannel {
    pub fn from_stream(stream: TcpStream) -> Result<Self, NetError> {
        let peer = NetAddress::from_socket_addr(stream.peer_addr()?).unwrap_or_default();
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            closed: watch::channel(false).0,
            peer,
        })
    }

    pub async fn connect(addr: NetAddress) -> Result<Self, NetError> {
        tracing::debug!(%addr, "connecting via TCP");
        let stream = TcpStream::connect(addr.to_socket_addr())
            .await
            .map_err(|source| NetError::ConnectFailed {
                addr: addr.to_string(),
                source,
            })?;
        Self::from_stream(stream)
    }

    async fn read_frame(&self) -> Result<Bytes, NetError> {
        let mut reader = self.reader.lock().await;
        let mut raw = [0u8; MESSAGE_HEADER_SIZE];
        read_exact(&mut reader, &mut raw).await?;
        let header = MessageHeader::from_bytes(&raw);
        let size = header.check()?;
        let mut payload = BytesMut::zeroed(size);
        read_exact(&mut reader, &mut payload).await?;
        header.validate(&payload)?;
        Ok(payload.freeze())
    }
}

async fn read_exact(reader: &mut OwnedReadHalf, buf: &mut [u8]) -> Result<(), NetError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(NetError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel").field("peer", &self.peer).finish()
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&self, payload: Bytes) -> Result<(), NetError> {
        if *self.closed.borrow() {
            return Err(NetError::ConnectionClosed);
        }
        let frame = encode_frame(&payload)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes, NetError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(NetError::ConnectionClosed);
        }
        tokio::select! {
            frame = self.read_frame() => frame,
            _ = closed.wait_for(|c| *c) => Err(NetError::ConnectionClosed),
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn description(&self) -> String {
        format!("tcp {}", self.peer)
    }
}

/// Opens the main connection: all upstream channels first, then the
/// downstream ones, each a separate TCP stream to the same port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub upstream_channels: usize,
    pub downstream_channels: usize,
}

impl TcpConnector {
    pub fn new(upstream_channels: usize, downstream_channels: usize) -> Self {
        Self {
            upstream_channels,
            downstream_channels,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: NetAddress) -> Result<Connection, NetError> {
        let mut upstream: Vec<Arc<dyn Channel>> = Vec::with_capacity(self.upstream_channels);
        for _ in 0..self.upstream_channels {
            upstream.push(Arc::new(TcpChannel::connect(addr).await?));
        }
        let mut downstream: Vec<Arc<dyn Channel>> = Vec::with_capacity(self.downstream_channels);
        for _ in 0..self.downstream_channels {
            downstream.push(Arc::new(TcpChannel::connect(addr).await?));
        }
        tracing::debug!(
            %addr,
            upstream = upstream.len(),
            downstream = downstream.len(),
            "connection established"
        );
        Ok(Connection::new(upstream, downstream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn listener() -> (tokio::net::TcpListener, NetAddress) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NetAddress::from_socket_addr(listener.local_addr().unwrap()).unwrap();
        (listener, addr)
    }

    async fn accept(listener: &tokio::net::TcpListener) -> TcpChannel {
        let (stream, _) = listener.accept().await.unwrap();
        TcpChannel::from_stream(stream).unwrap()
    }

    #[tokio::test]
    async fn test_frames_survive_the_wire() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move { accept(&listener).await });
        let client = TcpChannel::connect(addr).await.unwrap();
        let server = server.await.unwrap();

        client.send(Bytes::from_static(b"first")).await.unwrap();
        let big: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        client.send(Bytes::from(big.clone())).await.unwrap();

        assert_eq!(&server.receive().await.unwrap()[..], b"first");
        assert_eq!(server.receive().await.unwrap().to_vec(), big);
    }

    #[tokio::test]
    async fn test_garbage_is_rejected() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move { accept(&listener).await });
        let mut raw = TcpStream::connect(addr.to_socket_addr()).await.unwrap();
        let server = server.await.unwrap();

        raw.write_all(&[0x11, 0x22, 0x33, 0x44, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            server.receive().await,
            Err(NetError::InvalidMagic(0x11))
        ));
    }

    #[tokio::test]
    async fn test_peer_shutdown_is_connection_closed() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move { accept(&listener).await });
        let client = TcpChannel::connect(addr).await.unwrap();
        let server = server.await.unwrap();

        client.close().await;
        client.close().await;
        assert!(matches!(server.receive().await, Err(NetError::ConnectionClosed)));
        assert!(matches!(
            client.send(Bytes::from_static(b"late")).await,
            Err(NetError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_local_close_wakes_receiver() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move { accept(&listener).await });
        let client = Arc::new(TcpChannel::connect(addr).await.unwrap());
        let _server = server.await.unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.receive().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        client.close().await;
        assert!(matches!(
            pending.await.unwrap(),
            Err(NetError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connector_orders_upstream_before_downstream() {
        let (listener, addr) = listener().await;
        let accepted = tokio::spawn(async move {
            let mut channels = Vec::new();
            for _ in 0..3 {
                channels.push(accept(&listener).await);
            }
            channels
        });
        let conn = TcpConnector::new(2, 1).connect(addr).await.unwrap();
        let peers = accepted.await.unwrap();

        let up = conn.upstream_channel().await.unwrap();
        up.channel().send(Bytes::from_static(b"up")).await.unwrap();
        conn.downstream_channels()[0]
            .send(Bytes::from_static(b"down"))
            .await
            .unwrap();

        // The third accepted stream is the downstream one.
        assert_eq!(&peers[2].receive().await.unwrap()[..], b"down");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, addr) = listener().await;
        drop(listener);
        assert!(matches!(
            TcpChannel::connect(addr).await,
            Err(NetError::ConnectFailed { .. })
        ));
    }
}
