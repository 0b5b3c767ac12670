use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use netfs_types::{RPCCode, Status};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::connection::Connection;
use crate::error::NetError;
use crate::request_channel::RequestChannel;

/// A value that travels over a `RequestConnection`.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// True on every part of a multi-part reply except the last.
    fn more_to_come(&self) -> bool {
        false
    }
}

/// Receives what the peer sends unsolicited on the downstream channels.
#[async_trait]
pub trait RequestHandler<M: Message>: Send + Sync + 'static {
    async fn handle_request(&self, request: M) -> Result<(), Status>;

    /// Called at most once per connection, from whichever path saw the
    /// first transport failure.
    fn connection_broken(&self, error: Status);
}

tokio::task_local! {
    static READER_TASK: ();
}

struct Shared<M: Message> {
    connection: Connection,
    handler: Arc<dyn RequestHandler<M>>,
    timeout: Duration,
    broken: AtomicBool,
    closed: AtomicBool,
}

impl<M: Message> Shared<M> {
    async fn fail(&self, error: Status) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.broken.swap(true, Ordering::AcqRel) {
            tracing::warn!(%error, "connection broken");
            self.handler.connection_broken(error);
        }
        self.connection.close().await;
    }
}

/// Request/reply multiplexing over a `Connection`.
///
/// Each call borrows one upstream channel for its whole exchange. One reader
/// task per downstream channel feeds the handler.
pub struct RequestConnection<M: Message> {
    shared: Arc<Shared<M>>,
    readers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

async fn timed<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, NetError>>,
) -> Result<T, NetError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(NetError::Timeout),
    }
}

async fn read_loop<M: Message>(shared: Arc<Shared<M>>, channel: Arc<dyn Channel>) {
    let requests = RequestChannel::new(channel.as_ref());
    loop {
        match requests.receive_message::<M>().await {
            Ok(request) => {
                if let Err(status) = shared.handler.handle_request(request).await {
                    tracing::debug!(%status, "request handler failed");
                }
            }
            Err(NetError::Codec(e)) => {
                tracing::warn!(error = %e, channel = %channel.description(), "dropping undecodable request");
            }
            Err(err) => {
                if !shared.closed.load(Ordering::Acquire) {
                    shared.fail(err.into()).await;
                }
                break;
            }
        }
    }
}

impl<M: Message> RequestConnection<M> {
    /// Wrap an established connection and start its reader tasks.
    pub fn new(connection: Connection, handler: Arc<dyn RequestHandler<M>>, timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            connection,
            handler,
            timeout,
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let readers = shared
            .connection
            .downstream_channels()
            .iter()
            .map(|channel| {
                let fut = read_loop(shared.clone(), channel.clone());
                tokio::spawn(READER_TASK.scope((), fut))
            })
            .collect();
        Self {
            shared,
            readers: tokio::sync::Mutex::new(readers),
        }
    }

    /// One request, one reply.
    pub async fn send(&self, request: &M) -> Result<M, Status> {
        let mut reply = None;
        self.send_streaming(request, |part| {
            reply = Some(part);
            Ok(())
        })
        .await?;
        reply.ok_or_else(|| Status::new(RPCCode::BAD_DATA))
    }

    /// One request, any number of replies. `on_reply` sees every part until
    /// one arrives without `more_to_come`. After `on_reply` fails the rest of
    /// the stream is still drained so the channel stays usable, and the first
    /// failure is returned.
    pub async fn send_streaming<F>(&self, request: &M, mut on_reply: F) -> Result<(), Status>
    where
        F: FnMut(M) -> Result<(), Status> + Send,
    {
        if self.is_broken() || self.shared.closed.load(Ordering::Acquire) {
            return Err(Status::new(RPCCode::CONNECTION_CLOSED));
        }
        let upstream = self.shared.connection.upstream_channel().await?;
        let channel = RequestChannel::new(upstream.channel());
        let limit = self.shared.timeout;

        let exchange = async {
            timed(limit, channel.send_message(request)).await?;
            let mut first_error = None;
            loop {
                let reply: M = timed(limit, channel.receive_message()).await?;
                let more = reply.more_to_come();
                if first_error.is_none() {
                    if let Err(status) = on_reply(reply) {
                        first_error = Some(status);
                    }
                }
                if !more {
                    break;
                }
            }
            Ok::<_, NetError>(first_error)
        };

        match exchange.await {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(status),
            Err(err) => {
                let status = Status::from(err);
                drop(upstream);
                self.shared.fail(status.clone()).await;
                Err(status)
            }
        }
    }

    pub fn is_broken(&self) -> bool {
        self.shared.broken.load(Ordering::Acquire)
    }

    /// Close the connection and wait for the reader tasks to finish.
    /// Later calls fail with `CONNECTION_CLOSED`; closing again does nothing.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.connection.close().await;
        let mut readers = self.readers.lock().await;
        if READER_TASK.try_with(|_| ()).is_ok() {
            // A reader cannot wait for itself; the closed connection ends it.
            return;
        }
        for reader in readers.drain(..) {
            let _ = reader.await;
        }
    }
}

impl<M: Message> Drop for RequestConnection<M> {
    fn drop(&mut self) {
        if let Ok(readers) = self.readers.try_lock() {
            for reader in readers.iter() {
                reader.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use serde::Deserialize;

    use super::*;
    use crate::memory::connection_pair;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Msg {
        Ping(u32),
        Pong(u32),
        Part { index: u32, more: bool },
        Event(String),
    }

    impl Message for Msg {
        fn more_to_come(&self) -> bool {
            matches!(self, Msg::Part { more: true, .. })
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Msg>>,
        broken: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler<Msg> for Recorder {
        async fn handle_request(&self, request: Msg) -> Result<(), Status> {
            self.events.lock().push(request);
            Ok(())
        }

        fn connection_broken(&self, _error: Status) {
            self.broken.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Echo server: answers `Ping(n)` with `Pong(n)` and anything else with
    /// three parts.
    fn spawn_echo(peer: Connection) -> Arc<Connection> {
        let peer = Arc::new(peer);
        for channel in peer.downstream_channels().to_vec() {
            tokio::spawn(async move {
                let ch = RequestChannel::new(channel.as_ref());
                while let Ok(msg) = ch.receive_message::<Msg>().await {
                    match msg {
                        Msg::Ping(n) => ch.send_message(&Msg::Pong(n)).await.unwrap(),
                        _ => {
                            for index in 0..3 {
                                let part = Msg::Part {
                                    index,
                                    more: index < 2,
                                };
                                ch.send_message(&part).await.unwrap();
                            }
                        }
                    }
                }
            });
        }
        peer
    }

    fn client(conn: Connection, timeout: Duration) -> (RequestConnection<Msg>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (
            RequestConnection::new(conn, recorder.clone(), timeout),
            recorder,
        )
    }

    #[tokio::test]
    async fn test_send_gets_matching_reply() {
        let (conn, peer) = connection_pair(2, 1);
        let _peer = spawn_echo(peer);
        let (rc, _) = client(conn, Duration::from_secs(5));
        assert_eq!(rc.send(&Msg::Ping(7)).await.unwrap(), Msg::Pong(7));
        assert_eq!(rc.send(&Msg::Ping(8)).await.unwrap(), Msg::Pong(8));
    }

    #[tokio::test]
    async fn test_streaming_reply_until_last_part() {
        let (conn, peer) = connection_pair(1, 1);
        let _peer = spawn_echo(peer);
        let (rc, _) = client(conn, Duration::from_secs(5));

        let mut seen = Vec::new();
        rc.send_streaming(&Msg::Event("read".into()), |part| {
            seen.push(part);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen.len(), 3);

        // A failing handler still drains, so the channel stays in sync.
        let err = rc
            .send_streaming(&Msg::Event("read".into()), |_| {
                Err(Status::new(RPCCode::BAD_DATA))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), RPCCode::BAD_DATA);
        assert_eq!(rc.send(&Msg::Ping(1)).await.unwrap(), Msg::Pong(1));
    }

    #[tokio::test]
    async fn test_pushed_requests_reach_handler() {
        let (conn, peer) = connection_pair(1, 2);
        let (rc, recorder) = client(conn, Duration::from_secs(5));
        for (i, channel) in peer.upstream_channels().iter().enumerate() {
            RequestChannel::new(channel.as_ref())
                .send_message(&Msg::Event(format!("e{i}")))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut events = recorder.events.lock().clone();
        events.sort_by_key(|m| format!("{m:?}"));
        assert_eq!(events, vec![Msg::Event("e0".into()), Msg::Event("e1".into())]);
        rc.close().await;
    }

    #[tokio::test]
    async fn test_single_broken_notification() {
        let (conn, peer) = connection_pair(1, 3);
        let (rc, recorder) = client(conn, Duration::from_secs(5));
        peer.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rc.is_broken());
        assert_eq!(recorder.broken.load(Ordering::SeqCst), 1);
        let err = rc.send(&Msg::Ping(1)).await.unwrap_err();
        assert_eq!(err.code(), RPCCode::CONNECTION_CLOSED);
        assert_eq!(recorder.broken.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_breaks_connection() {
        let (conn, _silent_peer) = connection_pair(1, 1);
        let (rc, recorder) = client(conn, Duration::from_millis(30));
        let err = rc.send(&Msg::Ping(1)).await.unwrap_err();
        assert_eq!(err.code(), RPCCode::TIMEOUT);
        assert!(rc.is_broken());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.broken.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_twice_is_close_once() {
        let (conn, peer) = connection_pair(1, 2);
        let _peer = spawn_echo(peer);
        let (rc, recorder) = client(conn, Duration::from_secs(5));
        rc.close().await;
        rc.close().await;
        assert!(rc.readers.lock().await.is_empty());
        assert_eq!(recorder.broken.load(Ordering::SeqCst), 0);
        let err = rc.send(&Msg::Ping(1)).await.unwrap_err();
        assert_eq!(err.code(), RPCCode::CONNECTION_CLOSED);
    }
}
