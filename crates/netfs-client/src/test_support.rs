//! Shared fixtures: a scripted in-memory server and a probe volume.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use netfs_net::memory::MemoryConnector;
use netfs_net::{Connection, RequestChannel};
use netfs_proto::{InitConnectionReply, Request, StatusReply, S_IFDIR};
use netfs_types::{FsCode, LocalNodeId, NetAddress, Result, Status, StatusCode, status_code_t};
use parking_lot::Mutex;

use crate::auth::StaticCredentials;
use crate::config::ClientConfig;
use crate::query_manager::{QueryIterator, QueryIteratorKind, QueryIteratorRef};
use crate::vfs::VnodeTable;
use crate::volume::{DirCookie, DirEntry, Stat, Volume, VolumeBase, VolumeEvent, VolumeRef, WalkResult, unsupported};
use crate::volume_manager::VolumeManager;

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.discovery.enabled = false;
    config.retry.rpc_timeout = Duration::from_secs(2);
    config.connection.upstream_channels = 2;
    config
}

/// A manager whose connector never reaches anything.
pub fn test_manager() -> Arc<VolumeManager> {
    test_manager_with_vfs().0
}

pub fn test_manager_with_vfs() -> (Arc<VolumeManager>, Arc<VnodeTable>) {
    let (connector, _peers) = MemoryConnector::new(1, 1);
    let vfs = VnodeTable::new();
    let manager = VolumeManager::new(
        test_config(),
        vfs.clone(),
        Arc::new(StaticCredentials::new("guest", "guest")),
        Arc::new(connector),
    );
    (manager, vfs)
}

type Handler = Arc<dyn Fn(Request) -> Vec<Request> + Send + Sync>;

/// Answers requests with whatever its handler returns. `InitConnection` is
/// answered by the server itself; an empty answer becomes `NOT_SUPPORTED`.
pub struct FakeServer {
    handler: Mutex<Handler>,
    init_error: AtomicU16,
    received: Mutex<Vec<Request>>,
    peers: Mutex<Vec<Arc<Connection>>>,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(Arc::new(|_| Vec::new())),
            init_error: AtomicU16::new(StatusCode::OK),
            received: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_handler(&self, handler: impl Fn(Request) -> Vec<Request> + Send + Sync + 'static) {
        *self.handler.lock() = Arc::new(handler);
    }

    pub fn set_init_error(&self, code: status_code_t) {
        self.init_error.store(code, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Request> {
        self.received.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn answer(&self, request: Request) -> Vec<Request> {
        self.received.lock().push(request.clone());
        if let Request::InitConnection(_) = request {
            let error = self.init_error.load(Ordering::SeqCst);
            return vec![InitConnectionReply { error }.into()];
        }
        let handler = self.handler.lock().clone();
        let replies = handler(request);
        if replies.is_empty() {
            return vec![StatusReply { error: FsCode::NOT_SUPPORTED }.into()];
        }
        replies
    }

    fn serve(self: &Arc<Self>, peer: Connection) {
        let peer = Arc::new(peer);
        self.peers.lock().push(peer.clone());
        for channel in peer.downstream_channels().to_vec() {
            let server = self.clone();
            tokio::spawn(async move {
                let requests = RequestChannel::new(channel.as_ref());
                while let Ok(request) = requests.receive_message::<Request>().await {
                    for reply in server.answer(request) {
                        if requests.send_message(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    }

    /// Push an unsolicited request over the newest connection.
    pub async fn push(&self, request: impl Into<Request>) {
        let peer = self.peers.lock().last().cloned();
        let Some(peer) = peer else {
            panic!("no client connected");
        };
        let channel = peer.upstream_channels()[0].clone();
        RequestChannel::new(channel.as_ref())
            .send_message(&request.into())
            .await
            .unwrap();
    }

    pub async fn break_connections(&self) {
        let peers: Vec<_> = std::mem::take(&mut *self.peers.lock());
        for peer in peers {
            peer.close().await;
        }
    }
}

/// A volume manager wired to one `FakeServer` through memory connections.
pub struct TestEnv {
    pub manager: Arc<VolumeManager>,
    pub vfs: Arc<VnodeTable>,
    pub server: Arc<FakeServer>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let (connector, mut peers) =
            MemoryConnector::new(config.connection.upstream_channels, config.connection.downstream_channels);
        let server = FakeServer::new();
        let acceptor = server.clone();
        tokio::spawn(async move {
            while let Some((_, peer)) = peers.recv().await {
                acceptor.serve(peer);
            }
        });
        let vfs = VnodeTable::new();
        let manager = VolumeManager::new(
            config,
            vfs.clone(),
            Arc::new(StaticCredentials::new("guest", "guest")),
            Arc::new(connector),
        );
        Self { manager, vfs, server }
    }

    pub fn address(&self) -> NetAddress {
        NetAddress::from_octets(10, 0, 0, 7, 55555)
    }

    /// Poll `condition` until it holds; panics after two seconds.
    pub async fn wait_until(&self, condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }
}

/// A bare volume that counts what the manager does to it.
pub struct ProbeVolume {
    base: VolumeBase,
    root_id: LocalNodeId,
    prepared: AtomicUsize,
    uninits: AtomicUsize,
    events: AtomicUsize,
    freed: Mutex<Vec<u64>>,
    query_results: Mutex<Option<VecDeque<String>>>,
}

impl ProbeVolume {
    pub fn create(manager: &Arc<VolumeManager>) -> (Arc<Self>, VolumeRef) {
        Self::create_named(manager, "probe")
    }

    pub fn create_named(manager: &Arc<VolumeManager>, name: &str) -> (Arc<Self>, VolumeRef) {
        let id = manager.new_volume_id();
        let root_id = manager.new_node_id(id).unwrap();
        let probe = Arc::new_cyclic(|weak: &Weak<ProbeVolume>| {
            let this: Weak<dyn Volume> = weak.clone();
            ProbeVolume {
                base: VolumeBase::new(manager, id, name, this),
                root_id,
                prepared: AtomicUsize::new(0),
                uninits: AtomicUsize::new(0),
                events: AtomicUsize::new(0),
                freed: Mutex::new(Vec::new()),
                query_results: Mutex::new(None),
            }
        });
        let vref = manager.add_volume(probe.clone()).unwrap();
        (probe, vref)
    }

    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn uninits(&self) -> usize {
        self.uninits.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> usize {
        self.events.load(Ordering::SeqCst)
    }

    pub fn freed_iterators(&self) -> Vec<u64> {
        self.freed.lock().clone()
    }

    /// Make `open_query` succeed and `read_query` yield `names`.
    pub fn set_query_results(&self, names: Vec<&str>) {
        *self.query_results.lock() = Some(names.into_iter().map(str::to_owned).collect());
    }
}

#[async_trait]
impl Volume for ProbeVolume {
    fn base(&self) -> &VolumeBase {
        &self.base
    }

    fn root_id(&self) -> LocalNodeId {
        self.root_id
    }

    fn prepare_to_unmount(&self) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }

    fn uninit(&self) {
        self.uninits.fetch_add(1, Ordering::SeqCst);
        self.base.manager().remove_node_id(self.root_id);
    }

    async fn handle_event(&self, _event: VolumeEvent) {
        self.events.fetch_add(1, Ordering::SeqCst);
    }

    async fn read_vnode(&self, _id: LocalNodeId) -> Result<()> {
        Ok(())
    }

    fn write_vnode(&self, _id: LocalNodeId) {}

    fn remove_vnode(&self, _id: LocalNodeId) {}

    async fn read_stat(&self, node: LocalNodeId) -> Result<Stat> {
        Ok(Stat {
            dev: self.base.mount_id(),
            ino: node,
            mode: S_IFDIR | 0o755,
            ..Default::default()
        })
    }

    async fn open_dir(&self, _node: LocalNodeId) -> Result<DirCookie> {
        unsupported()
    }

    async fn read_dir(&self, _node: LocalNodeId, _cookie: &mut DirCookie, _count: usize) -> Result<Vec<DirEntry>> {
        unsupported()
    }

    async fn rewind_dir(&self, _node: LocalNodeId, _cookie: &mut DirCookie) -> Result<()> {
        unsupported()
    }

    async fn walk(&self, _dir: LocalNodeId, name: &str, _resolve_link: bool) -> Result<WalkResult> {
        Err(Status::with_message(FsCode::ENTRY_NOT_FOUND, name.to_owned()))
    }

    async fn open_query(&self, _query: &str, _flags: u32, _port: i32, _token: i32) -> Result<QueryIteratorRef> {
        if self.query_results.lock().is_none() {
            return unsupported();
        }
        let query_manager = self.base.manager().query_manager().clone();
        Ok(query_manager.add_iterator(
            self.base.this_weak(),
            self.root_id,
            QueryIteratorKind::Server { cookie: 0 },
        ))
    }

    async fn read_query(&self, _iterator: &QueryIteratorRef) -> Result<Option<DirEntry>> {
        let next = self.query_results.lock().as_mut().and_then(VecDeque::pop_front);
        Ok(next.map(|name| DirEntry {
            dev: self.base.mount_id(),
            ino: self.root_id,
            parent_dev: self.base.mount_id(),
            parent_ino: self.root_id,
            name,
        }))
    }

    fn free_query_iterator(&self, iterator: &QueryIterator) {
        self.freed.lock().push(iterator.id());
    }
}
