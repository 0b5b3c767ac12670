use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use netfs_types::NetAddress;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::channel::Channel;
use crate::error::NetError;

/// A set of channels to one peer.
///
/// Upstream channels carry client-initiated calls and are handed out one
/// caller at a time; downstream channels carry what the peer initiates and
/// are read by dedicated tasks.
pub struct Connection {
    idle: Mutex<Vec<Arc<dyn Channel>>>,
    permits: Semaphore,
    upstream: Vec<Arc<dyn Channel>>,
    downstream: Vec<Arc<dyn Channel>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(upstream: Vec<Arc<dyn Channel>>, downstream: Vec<Arc<dyn Channel>>) -> Self {
        Self {
            idle: Mutex::new(upstream.clone()),
            permits: Semaphore::new(upstream.len()),
            upstream,
            downstream,
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow an idle upstream channel, waiting while all are in use.
    pub async fn upstream_channel(&self) -> Result<UpstreamChannel<'_>, NetError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| NetError::ConnectionClosed)?;
        let channel = self.idle.lock().pop().ok_or(NetError::ConnectionClosed)?;
        Ok(UpstreamChannel {
            connection: self,
            channel,
            _permit: permit,
        })
    }

    /// All upstream channels, borrowed or not. A peer that pushes requests
    /// writes on these directly.
    pub fn upstream_channels(&self) -> &[Arc<dyn Channel>] {
        &self.upstream
    }

    pub fn downstream_channels(&self) -> &[Arc<dyn Channel>] {
        &self.downstream
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every channel. Pending and later `upstream_channel` calls fail.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        for channel in self.upstream.iter().chain(self.downstream.iter()) {
            channel.close().await;
        }
    }
}

/// An upstream channel on loan; goes back to the idle list on drop.
pub struct UpstreamChannel<'a> {
    connection: &'a Connection,
    channel: Arc<dyn Channel>,
    _permit: SemaphorePermit<'a>,
}

impl UpstreamChannel<'_> {
    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }
}

impl Drop for UpstreamChannel<'_> {
    fn drop(&mut self) {
        self.connection.idle.lock().push(self.channel.clone());
    }
}

/// Opens connections to a peer.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: NetAddress) -> Result<Connection, NetError>;
}
