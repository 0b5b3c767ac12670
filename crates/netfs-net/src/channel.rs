use async_trait::async_trait;
use bytes::Bytes;

use crate::error::NetError;

/// One duplex message stream.
///
/// A channel moves whole message payloads; any framing is the
/// implementation's business. `close` must wake a pending `receive`, which
/// then fails with `ConnectionClosed`.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn send(&self, payload: Bytes) -> Result<(), NetError>;

    async fn receive(&self) -> Result<Bytes, NetError>;

    async fn close(&self);

    fn description(&self) -> String {
        "channel".to_string()
    }
}
