use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::channel::Channel;
use crate::error::NetError;

/// Typed view of a channel: one postcard-encoded value per message.
pub struct RequestChannel<'a> {
    channel: &'a dyn Channel,
}

impl<'a> RequestChannel<'a> {
    pub fn new(channel: &'a dyn Channel) -> Self {
        Self { channel }
    }

    pub async fn send_message<M: Serialize + Sync>(&self, message: &M) -> Result<(), NetError> {
        let payload = postcard::to_allocvec(message)?;
        self.channel.send(Bytes::from(payload)).await
    }

    pub async fn receive_message<M: DeserializeOwned>(&self) -> Result<M, NetError> {
        let payload = self.channel.receive().await?;
        Ok(postcard::from_bytes(&payload)?)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::memory::MemoryChannel;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Msg {
        Hello { name: String },
        Count(u32),
    }

    #[tokio::test]
    async fn test_typed_exchange() {
        let (a, b) = MemoryChannel::pair();
        let (a, b) = (RequestChannel::new(&a), RequestChannel::new(&b));
        a.send_message(&Msg::Hello { name: "share".into() }).await.unwrap();
        a.send_message(&Msg::Count(3)).await.unwrap();
        assert_eq!(
            b.receive_message::<Msg>().await.unwrap(),
            Msg::Hello { name: "share".into() }
        );
        assert_eq!(b.receive_message::<Msg>().await.unwrap(), Msg::Count(3));
    }

    #[tokio::test]
    async fn test_undecodable_payload() {
        let (a, b) = MemoryChannel::pair();
        a.send(Bytes::from_static(&[0xff, 0xff, 0xff])).await.unwrap();
        let err = RequestChannel::new(&b).receive_message::<Msg>().await.unwrap_err();
        assert!(matches!(err, NetError::Codec(_)));
    }
}
