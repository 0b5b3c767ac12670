//! One directory per server, with a share volume per exported share.

use std::collections::BTreeSet;
use std::sync::Arc;

use netfs_proto::{CloseRequest, OpenQueryReply, OpenQueryRequest, ReadQueryReply, ReadQueryRequest};
use netfs_types::{FsCode, RPCCode, RemoteVolumeId, Result, Status};
use parking_lot::Mutex;

use crate::query_manager::{QueryIterator, QueryIteratorKind, QueryIteratorRef};
use crate::server_connection::{ServerConnection, ServerConnectionProvider};
use crate::server_manager::ExtendedServerInfo;
use crate::share_volume::ShareVolume;
use crate::virtual_volume::{VirtualVolume, virtual_volume_impl};
use crate::volume::{DirEntry, Volume, VolumeRef};
use crate::volume_manager::VolumeManager;

/// Remote volume id for requests not addressed to one share.
const NO_VOLUME: RemoteVolumeId = RemoteVolumeId(-1);

pub struct ServerVolume {
    virt: VirtualVolume,
    server_info: Mutex<Arc<ExtendedServerInfo>>,
    provider: Arc<ServerConnectionProvider>,
}

impl ServerVolume {
    pub fn create(
        manager: &Arc<VolumeManager>,
        name: &str,
        server_info: Arc<ExtendedServerInfo>,
    ) -> Result<(Arc<ServerVolume>, VolumeRef)> {
        let provider = Arc::new(ServerConnectionProvider::new(server_info.address()));
        let (server, vref) = VirtualVolume::create(manager, name, |virt| ServerVolume {
            virt,
            server_info: Mutex::new(server_info.clone()),
            provider,
        })?;
        for share in server_info.shares() {
            if let Err(err) = server.add_share(&share.share_name) {
                tracing::warn!(server = name, share = %share.share_name, %err, "share not added");
            }
        }
        tracing::info!(
            server = name,
            address = %server_info.address(),
            shares = server_info.shares().len(),
            "server volume created"
        );
        Ok((server, vref))
    }

    pub fn server_info(&self) -> Arc<ExtendedServerInfo> {
        self.server_info.lock().clone()
    }

    pub fn virt(&self) -> &VirtualVolume {
        &self.virt
    }

    fn add_share(&self, share_name: &str) -> Result<()> {
        let (_share, vref) = ShareVolume::create(
            self.virt.base().manager(),
            self.server_info(),
            self.provider.clone(),
            share_name,
        )?;
        let rejected = vref.clone();
        match self.virt.add_child_volume(vref) {
            Ok(()) => {
                drop(rejected);
                Ok(())
            }
            Err(err) => {
                rejected.base().set_unmounting();
                drop(rejected);
                Err(err)
            }
        }
    }

    /// Take a new descriptor of the server: shares it no longer exports are
    /// unmounted, new ones added.
    pub fn set_server_info(&self, info: Arc<ExtendedServerInfo>) {
        *self.server_info.lock() = info.clone();
        let wanted: BTreeSet<&str> = info.shares().iter().map(|s| s.share_name.as_str()).collect();
        let mut present = BTreeSet::new();
        for child in self.virt.children() {
            let name = child.base().name().to_owned();
            match child.as_share() {
                Some(share) if wanted.contains(name.as_str()) => {
                    share.set_server_info(info.clone());
                    present.insert(name);
                }
                _ => {
                    tracing::info!(server = self.virt.base().name(), share = %name, "share vanished");
                    self.virt.remove_child_volume(&*child);
                    retire_volume(child);
                }
            }
        }
        for name in wanted {
            if present.contains(name) {
                continue;
            }
            if let Err(err) = self.add_share(name) {
                tracing::warn!(server = self.virt.base().name(), share = name, %err, "share not added");
            }
        }
    }

    fn existing_connection(&self) -> Result<Arc<ServerConnection>> {
        self.provider
            .get_existing_server_connection()
            .ok_or_else(|| Status::with_message(RPCCode::NOT_CONNECTED, "no connection to server"))
    }

    /// The mounted share the server knows under one of `ids`.
    fn share_for(&self, ids: &[RemoteVolumeId]) -> Option<VolumeRef> {
        self.virt.children().into_iter().find(|child| {
            child
                .as_share()
                .and_then(ShareVolume::remote_volume_id)
                .is_some_and(|id| ids.contains(&id))
        })
    }

    async fn open_server_query(&self, query: &str, flags: u32, port: i32, token: i32) -> Result<QueryIteratorRef> {
        let queryable = self
            .virt
            .children()
            .iter()
            .any(|child| child.as_share().is_some_and(|s| s.is_connected() && s.supports_queries()));
        if !queryable {
            return Err(Status::with_message(FsCode::NOT_SUPPORTED, "no share supports queries"));
        }
        let connection = self.existing_connection()?;
        let reply: OpenQueryReply = connection
            .call(OpenQueryRequest {
                query_string: query.to_owned(),
                flags,
                port,
                token,
            })
            .await?;
        let query_manager = self.virt.base().manager().query_manager().clone();
        Ok(query_manager.add_iterator(
            self.virt.base().this_weak(),
            self.virt.root_id(),
            QueryIteratorKind::Server { cookie: reply.cookie },
        ))
    }

    async fn read_server_query(&self, iterator: &QueryIteratorRef) -> Result<Option<DirEntry>> {
        let QueryIteratorKind::Server { cookie } = iterator.kind() else {
            return Err(Status::with_message(FsCode::BAD_VALUE, "not a server query"));
        };
        let connection = self.existing_connection()?;
        loop {
            let reply: ReadQueryReply = connection.call(ReadQueryRequest { cookie, count: 1 }).await?;
            if reply.count <= 0 {
                return Ok(None);
            }
            // Entries of shares we have not mounted are skipped.
            let Some(share) = self.share_for(&reply.client_volume_ids) else {
                continue;
            };
            let Some(share) = share.as_share() else {
                continue;
            };
            match share.get_query_entry(&reply.entry_info, &reply.dir_info).await {
                Ok(entry) => return Ok(Some(entry)),
                Err(err) => {
                    tracing::debug!(share = share.share_name(), name = %reply.entry_info.name, %err, "query entry skipped");
                }
            }
        }
    }

    fn close_server_query(&self, iterator: &QueryIterator) {
        let QueryIteratorKind::Server { cookie } = iterator.kind() else {
            return;
        };
        let Some(connection) = self.provider.get_existing_server_connection() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let request = CloseRequest {
                volume_id: NO_VOLUME,
                cookie,
            };
            if let Err(err) = connection.call_status(request).await {
                tracing::debug!(cookie, %err, "closing server query failed");
            }
        });
    }

    fn uninit_server(&self) {
        self.virt.uninit();
        self.provider.close_connection();
    }
}

virtual_volume_impl!(ServerVolume, virt {
    fn as_server(&self) -> Option<&ServerVolume> {
        Some(self)
    }

    fn uninit(&self) {
        self.uninit_server()
    }

    async fn unmount(&self) {
        self.virt.unmount().await
    }

    async fn open_query(&self, query: &str, flags: u32, port: i32, token: i32) -> Result<QueryIteratorRef> {
        self.open_server_query(query, flags, port, token).await
    }

    async fn read_query(&self, iterator: &QueryIteratorRef) -> Result<Option<DirEntry>> {
        self.read_server_query(iterator).await
    }

    fn free_query_iterator(&self, iterator: &QueryIterator) {
        self.close_server_query(iterator)
    }
});

/// Unmount a volume that was already detached from its parent. The server
/// side is told first when a runtime is around.
pub(crate) fn retire_volume(volume: VolumeRef) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                volume.unmount().await;
                volume.base().set_unmounting();
                drop(volume);
            });
        }
        Err(_) => volume.base().set_unmounting(),
    }
}

impl std::fmt::Debug for ServerVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerVolume")
            .field("base", self.virt.base())
            .field("server", &self.server_info())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use netfs_proto::{
        EntryInfo, MountReply, NodeInfo, NodeStat, Request, S_IFDIR, S_IFREG, ServerInfo, ShareInfo, StatusReply,
        WalkReply, share_permissions,
    };
    use netfs_types::{RemoteNodeId, Revision, StatusCode};

    use super::*;
    use crate::test_support::TestEnv;
    use crate::volume::DirCookie;

    const REMOTE_VOL: i64 = 4;

    fn descriptor(env: &TestEnv, shares: &[&str]) -> Arc<ExtendedServerInfo> {
        let details = ServerInfo {
            server_name: "tower".into(),
            connection_method: "insecure".into(),
            shares: shares
                .iter()
                .map(|name| ShareInfo {
                    share_name: (*name).into(),
                })
                .collect(),
        };
        Arc::new(ExtendedServerInfo::with_details(env.address(), details))
    }

    fn node(node: i64, dir: bool) -> NodeInfo {
        NodeInfo {
            node_id: RemoteNodeId::new(REMOTE_VOL, node),
            stat: NodeStat {
                mode: if dir { S_IFDIR | 0o755 } else { S_IFREG | 0o644 },
                ..Default::default()
            },
            revision: Revision(1),
        }
    }

    fn names(server: &ServerVolume) -> Vec<String> {
        server.virt.children().iter().map(|c| c.base().name().to_owned()).collect()
    }

    #[tokio::test]
    async fn test_shares_follow_descriptor() {
        let env = TestEnv::new();
        let (server, vref) = ServerVolume::create(&env.manager, "tower", descriptor(&env, &["docs", "music"])).unwrap();
        assert_eq!(names(&server), vec!["docs", "music"]);
        assert_eq!(env.manager.volume_count(), 3);

        let root = server.root_id();
        let mut cookie = server.open_dir(root).await.unwrap();
        let listed: Vec<_> = server
            .read_dir(root, &mut cookie, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(matches!(cookie, DirCookie::Virtual(_)));
        assert_eq!(listed, vec![".", "..", "docs", "music"]);

        server.set_server_info(descriptor(&env, &["music", "photos"]));
        assert_eq!(names(&server), vec!["music", "photos"]);
        env.wait_until(|| env.manager.volume_count() == 3).await;
        assert!(server.virt.child("music").unwrap().as_share().is_some());

        server.base().set_unmounting();
        drop(vref);
        assert_eq!(env.manager.volume_count(), 0);
    }

    #[tokio::test]
    async fn test_query_without_connection_is_refused() {
        let env = TestEnv::new();
        let (server, vref) = ServerVolume::create(&env.manager, "tower", descriptor(&env, &["docs"])).unwrap();
        let err = server.open_query("name==*", 0, -1, -1).await.unwrap_err();
        assert_eq!(err.code(), FsCode::NOT_SUPPORTED);
        assert_eq!(env.server.connection_count(), 0);
        server.base().set_unmounting();
        drop(vref);
    }

    #[tokio::test]
    async fn test_query_entries_resolve_through_share() {
        let env = TestEnv::new();
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        env.server.set_handler(move |request| match request {
            Request::Mount(_) => vec![MountReply {
                error: StatusCode::OK,
                volume_id: RemoteVolumeId(REMOTE_VOL),
                share_permissions: share_permissions::MOUNT | share_permissions::QUERY,
                node_info: node(1, true),
                no_permission: false,
            }
            .into()],
            Request::Walk(_) => vec![WalkReply {
                error: FsCode::ENTRY_NOT_FOUND,
                ..Default::default()
            }
            .into()],
            Request::OpenQuery(q) => {
                assert_eq!(q.query_string, "name==*.txt");
                vec![OpenQueryReply {
                    cookie: 42,
                    ..Default::default()
                }
                .into()]
            }
            Request::ReadQuery(r) => {
                assert_eq!(r.cookie, 42);
                let reply = match counter.fetch_add(1, Ordering::SeqCst) {
                    // Belongs to a share we do not have.
                    0 => ReadQueryReply {
                        client_volume_ids: vec![RemoteVolumeId(77)],
                        dir_info: node(1, true),
                        entry_info: EntryInfo {
                            directory_id: RemoteNodeId::new(77, 1),
                            name: "elsewhere.txt".into(),
                            node_info: node(60, false),
                        },
                        count: 1,
                        ..Default::default()
                    },
                    1 => ReadQueryReply {
                        client_volume_ids: vec![RemoteVolumeId(REMOTE_VOL)],
                        dir_info: node(1, true),
                        entry_info: EntryInfo {
                            directory_id: RemoteNodeId::new(REMOTE_VOL, 1),
                            name: "notes.txt".into(),
                            node_info: node(50, false),
                        },
                        count: 1,
                        ..Default::default()
                    },
                    _ => ReadQueryReply::default(),
                };
                vec![reply.into()]
            }
            Request::Close(c) => {
                assert_eq!(c.volume_id, RemoteVolumeId(-1));
                vec![StatusReply::ok().into()]
            }
            _ => vec![],
        });
        let (server, vref) = ServerVolume::create(&env.manager, "tower", descriptor(&env, &["docs"])).unwrap();
        let docs = server.virt.child("docs").unwrap();
        let share = docs.as_share().unwrap();
        // Any share operation mounts it.
        share.walk(share.root_id(), "nothing", false).await.unwrap_err();
        assert!(share.supports_queries());

        let iterator = server.open_query("name==*.txt", 0, -1, -1).await.unwrap();
        let entry = server.read_query(&iterator).await.unwrap().unwrap();
        assert_eq!(entry.name, "notes.txt");
        assert_eq!(entry.parent_ino, share.root_id());
        assert_eq!(server.read_query(&iterator).await.unwrap(), None);
        assert_eq!(reads.load(Ordering::SeqCst), 3);

        drop(iterator);
        env.wait_until(|| env.server.received().iter().any(|r| r.kind() == "Close")).await;
        assert_eq!(env.manager.query_manager().iterator_count(), 0);

        drop(docs);
        server.base().set_unmounting();
        drop(vref);
    }
}
