//! The main connection to one server, shared by all its share volumes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use netfs_net::{RequestConnection, RequestHandler};
use netfs_proto::{InitConnectionReply, InitConnectionRequest, Reply, Request, StatusReply};
use netfs_types::{NetAddress, RemoteVolumeId, Result, Status};
use parking_lot::Mutex;

use crate::share_volume::ShareVolume;
use crate::volume::{Volume, VolumeEvent};
use crate::volume_manager::VolumeManager;

/// Routes unsolicited server requests to the share volumes of a connection.
struct Routing {
    manager: Weak<VolumeManager>,
    volumes: Mutex<HashMap<RemoteVolumeId, Weak<ShareVolume>>>,
}

impl Routing {
    fn share(&self, id: RemoteVolumeId) -> Option<Arc<ShareVolume>> {
        self.volumes.lock().get(&id).and_then(Weak::upgrade)
    }
}

#[async_trait]
impl RequestHandler<Request> for Routing {
    async fn handle_request(&self, request: Request) -> Result<()> {
        let Some(header) = request.monitor_header() else {
            tracing::debug!(kind = request.kind(), "unexpected request from server");
            return Ok(());
        };
        let volume_id = header.volume_id;
        match self.share(volume_id) {
            Some(share) => share.handle_monitor_request(request).await,
            None => {
                tracing::trace!(remote_volume = %volume_id, "monitor event for unknown volume");
                Ok(())
            }
        }
    }

    fn connection_broken(&self, error: Status) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let shares: Vec<_> = self.volumes.lock().values().filter_map(Weak::upgrade).collect();
        tracing::info!(%error, shares = shares.len(), "server connection broken");
        for share in shares {
            manager.send_volume_event(VolumeEvent::ConnectionBroken {
                volume_id: share.base().id(),
            });
        }
    }
}

pub struct ServerConnection {
    address: NetAddress,
    connection: RequestConnection<Request>,
    routing: Arc<Routing>,
}

impl ServerConnection {
    /// Connect and run the `InitConnection` handshake.
    pub async fn open(manager: &Arc<VolumeManager>, address: NetAddress) -> Result<Arc<Self>> {
        let connection = manager.connector().connect(address).await?;
        let routing = Arc::new(Routing {
            manager: Arc::downgrade(manager),
            volumes: Mutex::new(HashMap::new()),
        });
        let server = Arc::new(Self {
            address,
            connection: RequestConnection::new(connection, routing.clone(), manager.config().retry.rpc_timeout),
            routing,
        });

        let init = InitConnectionRequest {
            big_endian: cfg!(target_endian = "big"),
        };
        if let Err(err) = server.call::<InitConnectionReply>(init).await {
            tracing::warn!(%address, %err, "connection handshake failed");
            server.close().await;
            return Err(err);
        }
        tracing::info!(%address, "connected to server");
        Ok(server)
    }

    pub fn address(&self) -> NetAddress {
        self.address
    }

    /// Send `request` and convert the single reply.
    pub async fn request<R>(&self, request: impl Into<Request> + Send) -> Result<R>
    where
        R: TryFrom<Request, Error = Status>,
    {
        let reply = self.connection.send(&request.into()).await?;
        R::try_from(reply)
    }

    /// Like `request`, with a server-reported error turned into `Err`.
    pub async fn call<R>(&self, request: impl Into<Request> + Send) -> Result<R>
    where
        R: TryFrom<Request, Error = Status> + Reply,
    {
        self.request::<R>(request).await?.into_result()
    }

    pub async fn call_status(&self, request: impl Into<Request> + Send) -> Result<()> {
        self.call::<StatusReply>(request).await.map(drop)
    }

    /// A request answered by a sequence of replies.
    pub async fn stream<R, F>(&self, request: impl Into<Request> + Send, mut on_reply: F) -> Result<()>
    where
        R: TryFrom<Request, Error = Status> + Reply,
        F: FnMut(R) -> Result<()> + Send,
    {
        self.connection
            .send_streaming(&request.into(), |reply| on_reply(R::try_from(reply)?.into_result()?))
            .await
    }

    /// Route monitor events for `id` to `share`.
    pub fn add_volume(&self, id: RemoteVolumeId, share: Weak<ShareVolume>) {
        self.routing.volumes.lock().insert(id, share);
    }

    pub fn remove_volume(&self, id: RemoteVolumeId) {
        self.routing.volumes.lock().remove(&id);
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_broken()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Hands out the one live connection to a server, opening it on demand.
pub struct ServerConnectionProvider {
    address: NetAddress,
    slot: Mutex<Option<Arc<ServerConnection>>>,
    gate: tokio::sync::Mutex<()>,
}

impl ServerConnectionProvider {
    pub fn new(address: NetAddress) -> Self {
        Self {
            address,
            slot: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn address(&self) -> NetAddress {
        self.address
    }

    /// The live connection, reconnecting when there is none.
    pub async fn get_server_connection(&self, manager: &Arc<VolumeManager>) -> Result<Arc<ServerConnection>> {
        if let Some(connection) = self.get_existing_server_connection() {
            return Ok(connection);
        }
        let _gate = self.gate.lock().await;
        if let Some(connection) = self.get_existing_server_connection() {
            return Ok(connection);
        }
        let stale = self.slot.lock().take();
        if let Some(stale) = stale {
            stale.close().await;
        }
        let connection = ServerConnection::open(manager, self.address).await?;
        *self.slot.lock() = Some(connection.clone());
        Ok(connection)
    }

    /// The current connection if it is still usable.
    pub fn get_existing_server_connection(&self) -> Option<Arc<ServerConnection>> {
        self.slot.lock().as_ref().filter(|c| c.is_connected()).cloned()
    }

    /// Drop the connection and close it in the background.
    pub fn close_connection(&self) {
        let Some(connection) = self.slot.lock().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { connection.close().await });
            }
            Err(_) => tracing::debug!(address = %self.address, "no runtime, connection closed on drop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use netfs_proto::{InitConnectionReply, UnlinkRequest};
    use netfs_types::{FsCode, RPCCode, StatusCode};

    use super::*;
    use crate::test_support::TestEnv;

    fn unlink() -> UnlinkRequest {
        UnlinkRequest {
            volume_id: RemoteVolumeId(1),
            directory_id: netfs_types::RemoteNodeId::new(1, 2),
            name: "x".into(),
        }
    }

    #[tokio::test]
    async fn test_handshake_and_calls() {
        let env = TestEnv::new();
        env.server.set_handler(|request| match request {
            Request::Unlink(r) if r.name == "x" => vec![StatusReply::ok().into()],
            Request::Unlink(_) => vec![StatusReply { error: FsCode::ENTRY_NOT_FOUND }.into()],
            _ => vec![],
        });
        let connection = ServerConnection::open(&env.manager, env.address()).await.unwrap();
        assert!(connection.is_connected());
        assert!(matches!(env.server.received()[0], Request::InitConnection(_)));

        connection.call_status(unlink()).await.unwrap();
        let mut missing = unlink();
        missing.name = "y".into();
        let err = connection.call_status(missing).await.unwrap_err();
        assert_eq!(err.code(), FsCode::ENTRY_NOT_FOUND);

        connection.close().await;
        connection.close().await;
        let err = connection.call_status(unlink()).await.unwrap_err();
        assert_eq!(err.code(), RPCCode::CONNECTION_CLOSED);
    }

    #[tokio::test]
    async fn test_wrong_reply_type_is_bad_data() {
        let env = TestEnv::new();
        env.server.set_handler(|_| vec![InitConnectionReply::default().into()]);
        let connection = ServerConnection::open(&env.manager, env.address()).await.unwrap();
        let err = connection.call_status(unlink()).await.unwrap_err();
        assert_eq!(err.code(), RPCCode::BAD_DATA);
        connection.close().await;
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let env = TestEnv::new();
        env.server.set_init_error(StatusCode::IO_ERROR);
        let err = ServerConnection::open(&env.manager, env.address()).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::IO_ERROR);
    }

    #[tokio::test]
    async fn test_provider_reconnects_after_break() {
        let env = TestEnv::new();
        let provider = ServerConnectionProvider::new(env.address());
        assert!(provider.get_existing_server_connection().is_none());
        let first = provider.get_server_connection(&env.manager).await.unwrap();
        let again = provider.get_server_connection(&env.manager).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        env.server.break_connections().await;
        env.wait_until(|| !first.is_connected()).await;
        assert!(provider.get_existing_server_connection().is_none());
        let second = provider.get_server_connection(&env.manager).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_connected());
        provider.close_connection();
        assert!(provider.get_existing_server_connection().is_none());
    }
}
