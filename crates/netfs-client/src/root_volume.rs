//! The mount root: one directory per known server.

use std::sync::{Arc, OnceLock, Weak};

use netfs_types::{FsCode, LocalNodeId, NetAddress, Result, Status};

use crate::query_manager::QueryIteratorRef;
use crate::server_manager::{ExtendedServerInfo, ServerInfoSource, ServerManager, ServerManagerListener, TcpServerInfoSource};
use crate::server_volume::{ServerVolume, retire_volume};
use crate::virtual_volume::{VirtualVolume, virtual_volume_impl};
use crate::volume::{DirEntry, Volume, VolumeRef};
use crate::volume_manager::VolumeManager;

/// Control requests understood by the root directory.
pub mod ioctl {
    use netfs_types::{FsCode, RPCCode, Result, Status};

    pub const ADD_SERVER: u32 = 10001;
    pub const REMOVE_SERVER: u32 = 10002;
    /// Size of the NUL-terminated server name argument.
    pub const SERVER_NAME_LEN: usize = 256;

    /// Build the argument of `ADD_SERVER` and `REMOVE_SERVER`.
    pub fn server_name_arg(name: &str) -> Result<[u8; SERVER_NAME_LEN]> {
        if name.is_empty() || name.len() >= SERVER_NAME_LEN || name.contains('\0') {
            return Err(Status::with_message(FsCode::BAD_VALUE, format!("invalid server name {name:?}")));
        }
        let mut arg = [0u8; SERVER_NAME_LEN];
        arg[..name.len()].copy_from_slice(name.as_bytes());
        Ok(arg)
    }

    pub(crate) fn parse_server_name(buffer: &[u8]) -> Result<&str> {
        let field = buffer
            .get(..SERVER_NAME_LEN)
            .ok_or_else(|| Status::with_message(FsCode::BAD_VALUE, "server name argument too short"))?;
        let len = field
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Status::with_message(RPCCode::BAD_DATA, "server name not terminated"))?;
        if len == 0 {
            return Err(Status::with_message(FsCode::BAD_VALUE, "empty server name"));
        }
        std::str::from_utf8(&field[..len]).map_err(|_| Status::with_message(FsCode::BAD_VALUE, "server name is not UTF-8"))
    }
}

pub struct RootVolume {
    virt: VirtualVolume,
    server_manager: OnceLock<Arc<ServerManager>>,
}

impl RootVolume {
    /// Create the root and start discovery, fetching server descriptors
    /// over TCP.
    pub async fn mount(manager: &Arc<VolumeManager>) -> Result<(Arc<RootVolume>, VolumeRef)> {
        let config = manager.config();
        let source = Arc::new(TcpServerInfoSource::new(config.discovery.server_info_port, config.retry.clone()));
        Self::mount_with_source(manager, source).await
    }

    pub async fn mount_with_source(
        manager: &Arc<VolumeManager>,
        source: Arc<dyn ServerInfoSource>,
    ) -> Result<(Arc<RootVolume>, VolumeRef)> {
        let (root, vref) = VirtualVolume::create(manager, "", |virt| RootVolume {
            virt,
            server_manager: OnceLock::new(),
        })?;
        let listener: Weak<dyn ServerManagerListener> = Arc::downgrade(&root) as Weak<RootVolume>;
        let server_manager = ServerManager::new(manager.config().clone(), listener, source);
        let _ = root.server_manager.set(server_manager.clone());
        if let Err(err) = server_manager.start().await {
            tracing::error!(%err, "server discovery failed to start");
            vref.base().set_unmounting();
            drop(vref);
            return Err(err);
        }
        Ok((root, vref))
    }

    pub fn server_manager(&self) -> Option<&Arc<ServerManager>> {
        self.server_manager.get()
    }

    pub fn virt(&self) -> &VirtualVolume {
        &self.virt
    }

    /// The server volume of the server at `address`.
    pub fn server_volume(&self, address: NetAddress) -> Option<VolumeRef> {
        self.virt.children().into_iter().find(|child| {
            child
                .as_server()
                .is_some_and(|server| server.server_info().address().ip == address.ip)
        })
    }

    async fn resolve_server(&self, name: &str) -> Result<NetAddress> {
        let port = self.virt.base().manager().config().discovery.connection_port;
        let resolved = tokio::net::lookup_host((name, port))
            .await
            .map_err(|err| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("cannot resolve {name}: {err}")))?;
        resolved
            .filter_map(NetAddress::from_socket_addr)
            .next()
            .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("{name} has no IPv4 address")))
    }

    async fn control(&self, node: LocalNodeId, command: u32, buffer: &[u8]) -> Result<()> {
        if node != self.virt.root_id() {
            return Err(Status::with_message(FsCode::BAD_VALUE, "control requests go to the root directory"));
        }
        if command != ioctl::ADD_SERVER && command != ioctl::REMOVE_SERVER {
            return Err(Status::with_message(FsCode::BAD_VALUE, format!("unknown control request {command}")));
        }
        let name = ioctl::parse_server_name(buffer)?;
        let address = self.resolve_server(name).await?;
        let server_manager = self
            .server_manager
            .get()
            .ok_or_else(|| Status::with_message(FsCode::BUSY, "discovery not started"))?;
        if command == ioctl::ADD_SERVER {
            tracing::info!(name, %address, "adding server");
            server_manager.add_server(address);
        } else {
            tracing::info!(name, %address, "removing server");
            server_manager.remove_server(address);
        }
        Ok(())
    }

    async fn unmount_root(&self) {
        if let Some(server_manager) = self.server_manager.get() {
            server_manager.shutdown().await;
        }
        self.virt.unmount().await;
    }

    fn server_entry_name(&self, info: &ExtendedServerInfo) -> String {
        let name = info.display_name();
        if self.virt.child(&name).is_none() {
            return name;
        }
        format!("{name} ({})", info.address().ipv4())
    }
}

impl ServerManagerListener for RootVolume {
    fn server_added(&self, info: Arc<ExtendedServerInfo>) {
        if self.virt.base().is_unmounting() {
            return;
        }
        let name = self.server_entry_name(&info);
        let (_server, vref) = match ServerVolume::create(self.virt.base().manager(), &name, info.clone()) {
            Ok(created) => created,
            Err(err) => {
                tracing::warn!(server = %name, %err, "server volume not created");
                return;
            }
        };
        let rejected = vref.clone();
        match self.virt.add_child_volume(vref) {
            Ok(()) => drop(rejected),
            Err(err) => {
                tracing::warn!(server = %name, %err, "server volume not added");
                rejected.base().set_unmounting();
                drop(rejected);
            }
        }
    }

    fn server_updated(&self, old: Arc<ExtendedServerInfo>, new: Arc<ExtendedServerInfo>) {
        if self.virt.base().is_unmounting() {
            return;
        }
        let Some(child) = self.server_volume(old.address()) else {
            self.server_added(new);
            return;
        };
        if let Some(server) = child.as_server() {
            server.set_server_info(new);
        }
    }

    fn server_removed(&self, info: Arc<ExtendedServerInfo>) {
        let Some(child) = self.server_volume(info.address()) else {
            return;
        };
        tracing::info!(server = child.base().name(), address = %info.address(), "server gone");
        self.virt.remove_child_volume(&*child);
        retire_volume(child);
    }
}

virtual_volume_impl!(RootVolume, virt {
    fn uninit(&self) {
        self.virt.uninit()
    }

    async fn unmount(&self) {
        self.unmount_root().await
    }

    async fn ioctl(&self, node: LocalNodeId, command: u32, buffer: &[u8]) -> Result<()> {
        self.control(node, command, buffer).await
    }

    async fn open_query(&self, query: &str, flags: u32, port: i32, token: i32) -> Result<QueryIteratorRef> {
        self.virt.open_query(query, flags, port, token).await
    }

    async fn read_query(&self, iterator: &QueryIteratorRef) -> Result<Option<DirEntry>> {
        self.virt.read_query(iterator).await
    }
});

#[cfg(test)]
mod tests {
    use crate::vfs::HostVfs;
    use async_trait::async_trait;
    use netfs_proto::{ServerInfo, ShareInfo};
    use netfs_types::RPCCode;

    use super::*;
    use crate::test_support::TestEnv;

    struct FixedSource(ServerInfo);

    #[async_trait]
    impl ServerInfoSource for FixedSource {
        async fn fetch_server_info(&self, _address: NetAddress) -> Result<ServerInfo> {
            Ok(self.0.clone())
        }
    }

    fn server_info(shares: &[&str]) -> ServerInfo {
        ServerInfo {
            server_name: "tower".into(),
            connection_method: "insecure".into(),
            shares: shares
                .iter()
                .map(|name| ShareInfo {
                    share_name: (*name).into(),
                })
                .collect(),
        }
    }

    async fn mounted(env: &TestEnv) -> (Arc<RootVolume>, VolumeRef) {
        let source = Arc::new(FixedSource(server_info(&["docs"])));
        RootVolume::mount_with_source(&env.manager, source).await.unwrap()
    }

    fn child_names(root: &RootVolume) -> Vec<String> {
        root.virt.children().iter().map(|c| c.base().name().to_owned()).collect()
    }

    #[tokio::test]
    async fn test_servers_added_and_removed_by_name() {
        let env = TestEnv::new();
        let (root, vref) = mounted(&env).await;
        let root_id = root.root_id();

        let arg = ioctl::server_name_arg("127.0.0.1").unwrap();
        root.ioctl(root_id, ioctl::ADD_SERVER, &arg).await.unwrap();
        env.wait_until(|| root.virt.child("tower").is_some()).await;
        let address = NetAddress::from_octets(127, 0, 0, 1, 0);
        let server = root.server_volume(address).unwrap();
        let shares: Vec<_> = server.as_server().unwrap().virt().children().iter().map(|c| c.base().name().to_owned()).collect();
        assert_eq!(shares, vec!["docs"]);
        drop(server);
        assert_eq!(env.manager.volume_count(), 3);

        let walked = root.walk(root_id, "tower", false).await.unwrap();
        env.vfs.put_vnode(walked.node).unwrap();

        root.ioctl(root_id, ioctl::REMOVE_SERVER, &arg).await.unwrap();
        assert!(root.virt.child("tower").is_none());
        env.wait_until(|| env.manager.volume_count() == 1).await;

        root.base().set_unmounting();
        drop(vref);
        assert_eq!(env.manager.volume_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_control_requests() {
        let env = TestEnv::new();
        let (root, vref) = mounted(&env).await;
        let root_id = root.root_id();

        let empty = [0u8; ioctl::SERVER_NAME_LEN];
        let err = root.ioctl(root_id, ioctl::ADD_SERVER, &empty).await.unwrap_err();
        assert_eq!(err.code(), FsCode::BAD_VALUE);

        let unterminated = [b'a'; ioctl::SERVER_NAME_LEN];
        let err = root.ioctl(root_id, ioctl::ADD_SERVER, &unterminated).await.unwrap_err();
        assert_eq!(err.code(), RPCCode::BAD_DATA);

        let err = root.ioctl(root_id, ioctl::ADD_SERVER, b"short\0").await.unwrap_err();
        assert_eq!(err.code(), FsCode::BAD_VALUE);

        let arg = ioctl::server_name_arg("127.0.0.1").unwrap();
        let err = root.ioctl(root_id, 4711, &arg).await.unwrap_err();
        assert_eq!(err.code(), FsCode::BAD_VALUE);

        assert!(ioctl::server_name_arg("").is_err());
        assert!(ioctl::server_name_arg(&"x".repeat(ioctl::SERVER_NAME_LEN)).is_err());
        assert!(child_names(&root).is_empty());

        root.base().set_unmounting();
        drop(vref);
    }

    #[tokio::test]
    async fn test_listener_tracks_server_lifecycle() {
        let env = TestEnv::new();
        let (root, vref) = mounted(&env).await;
        let first = Arc::new(ExtendedServerInfo::with_details(
            NetAddress::from_octets(10, 0, 0, 7, 55555),
            server_info(&["docs"]),
        ));
        let twin = Arc::new(ExtendedServerInfo::with_details(
            NetAddress::from_octets(10, 0, 0, 8, 55555),
            server_info(&[]),
        ));
        root.server_added(first.clone());
        root.server_added(twin.clone());
        assert_eq!(child_names(&root), vec!["tower", "tower (10.0.0.8)"]);

        let updated = Arc::new(ExtendedServerInfo::with_details(first.address(), server_info(&["docs", "music"])));
        root.server_updated(first.clone(), updated);
        let server = root.server_volume(first.address()).unwrap();
        let shares: Vec<_> = server.as_server().unwrap().virt().children().iter().map(|c| c.base().name().to_owned()).collect();
        assert_eq!(shares, vec!["docs", "music"]);
        drop(server);

        root.server_removed(twin);
        assert_eq!(child_names(&root), vec!["tower"]);

        // Queries of servers that are not connected are left out.
        let iterator = root.open_query("name==*", 0, -1, -1).await.unwrap();
        assert_eq!(root.read_query(&iterator).await.unwrap(), None);
        drop(iterator);

        root.unmount().await;
        root.base().set_unmounting();
        drop(vref);
        env.wait_until(|| env.manager.volume_count() == 0).await;
    }

    #[tokio::test]
    async fn test_manager_mounts_and_unmounts_root() {
        let env = TestEnv::new();
        let root_id = env.manager.mount_root_volume().await.unwrap();
        let root = env.manager.root_volume().unwrap();
        assert_eq!(root.root_id(), root_id);
        let err = env.manager.mount_root_volume().await.unwrap_err();
        assert_eq!(err.code(), FsCode::EXISTS);
        drop(root);

        env.manager.unmount().await;
        assert_eq!(env.manager.volume_count(), 0);
        assert!(env.manager.root_volume().is_none());
    }
}
