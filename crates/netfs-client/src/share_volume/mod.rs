//! A volume backed by one share of a remote server.
//!
//! Nodes are cached under local ids from the volume manager and kept
//! current by the server's node-monitoring events. The share is mounted on
//! first use; once the connection is lost it stays closed.

mod cache;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use netfs_proto::{
    AttributeChangedRequest, CloseRequest, Cookie, CreateFileReply, CreateFileRequest, CreateLinkRequest,
    CreateSymlinkRequest, EntryCreatedRequest, EntryInfo, EntryMovedRequest, EntryRemovedRequest, MakeDirRequest,
    MonitorHeader, MonitorOpcode, MountReply, MountRequest, MultiWalkReply, MultiWalkRequest, NodeInfo,
    OpenAttrDirReply, OpenAttrDirRequest, OpenDirReply, OpenDirRequest, OpenReply, OpenRequest, ReadAttrDirReply,
    ReadAttrDirRequest, ReadAttrReply, ReadAttrRequest, ReadDirReply, ReadDirRequest, ReadLinkReply, ReadLinkRequest,
    ReadReply, ReadRequest, ReadVNodeReply, ReadVNodeRequest, RemoveAttrRequest, RemoveDirRequest, RenameAttrRequest,
    RenameRequest, Reply, Request, StatAttrReply, StatAttrRequest, StatChangedRequest, UnlinkRequest,
    UnmountRequest, WalkReply, WalkRequest, WriteAttrRequest, WriteRequest, WriteStatReply, WriteStatRequest,
    open_mode, share_permissions,
};
use netfs_types::{FsCode, LocalNodeId, RPCCode, RemoteNodeId, RemoteVolumeId, Result, Revision, ServerCode, Status};
use parking_lot::Mutex;

use self::cache::{ShareCache, is_dot_name};
use crate::server_connection::{ServerConnection, ServerConnectionProvider};
use crate::server_manager::ExtendedServerInfo;
use crate::vfs::NodeMonitorEvent;
use crate::volume::{
    AttrStat, DirCookie, DirEntry, FileCookie, Stat, Volume, VolumeBase, VolumeEvent, VolumeRef, WalkResult,
};
use crate::volume_manager::VolumeManager;

/// Largest payload of one write request.
const MAX_WRITE_SIZE: usize = 64 * 1024;
/// Entries asked for per directory page.
const READ_DIR_PAGE: i32 = 32;
/// Attempts at getting an entry info that is not already obsolete.
const MAX_REFETCH: usize = 10;

#[derive(Clone)]
struct Session {
    connection: Arc<ServerConnection>,
    volume_id: RemoteVolumeId,
}

enum ConnectionState {
    NotInitialized,
    Ready(Session),
    Closed,
}

fn not_connected() -> Status {
    Status::new(RPCCode::NOT_CONNECTED)
}

fn foreign_cookie() -> Status {
    Status::with_message(FsCode::BAD_VALUE, "foreign directory cookie")
}

fn stale_entry(name: &str) -> Status {
    Status::with_message(FsCode::BUSY, format!("entry info for {name} kept going stale"))
}

fn wire_size(size: usize) -> i32 {
    i32::try_from(size).unwrap_or(i32::MAX)
}

#[derive(Debug)]
struct RemoteListing {
    cookie: Cookie,
    /// Directory revision when the listing (re)started.
    revision: Revision,
    done: bool,
    rewind: bool,
}

/// Cursor over a share directory: either a snapshot of a complete cached
/// directory or one page of a server listing at a time. Names are
/// re-resolved on every read, so removed entries are skipped.
#[derive(Debug)]
pub struct ShareDirIterator {
    names: Vec<String>,
    index: usize,
    listing: Option<RemoteListing>,
}

impl ShareDirIterator {
    fn local(names: Vec<String>) -> Self {
        Self {
            names,
            index: 0,
            listing: None,
        }
    }

    fn remote(cookie: Cookie) -> Self {
        Self {
            names: Vec::new(),
            index: 0,
            listing: Some(RemoteListing {
                cookie,
                revision: Revision::NONE,
                done: false,
                rewind: false,
            }),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.listing.is_some()
    }

    fn is_done(&self) -> bool {
        self.listing.as_ref().is_none_or(|l| l.done)
    }
}

#[derive(Debug)]
enum AttrDirState {
    Local { names: Vec<String>, index: usize },
    Remote { cookie: Cookie, rewind: bool },
}

/// Open attribute directory of a share node.
#[derive(Debug)]
pub struct AttrDirCookie(AttrDirState);

impl AttrDirCookie {
    pub fn is_remote(&self) -> bool {
        matches!(self.0, AttrDirState::Remote { .. })
    }
}

/// Collects the parts of a streamed read, checking that each continues
/// where the previous one ended.
struct StreamedRead {
    pos: i64,
    limit: usize,
    data: Vec<u8>,
}

impl StreamedRead {
    fn new(pos: i64, limit: usize) -> Self {
        Self {
            pos,
            limit,
            data: Vec::new(),
        }
    }

    fn accept(&mut self, pos: i64, chunk: Vec<u8>) -> Result<()> {
        if pos != self.pos {
            return Err(Status::with_message(
                RPCCode::BAD_DATA,
                format!("read part at {pos}, expected {}", self.pos),
            ));
        }
        if chunk.len() > self.limit - self.data.len() {
            return Err(Status::with_message(RPCCode::BAD_DATA, "read part overflows the buffer"));
        }
        self.pos += chunk.len() as i64;
        self.data.extend_from_slice(&chunk);
        Ok(())
    }
}

pub struct ShareVolume {
    base: VolumeBase,
    root_id: LocalNodeId,
    this: Weak<ShareVolume>,
    server_info: Mutex<Arc<ExtendedServerInfo>>,
    provider: Arc<ServerConnectionProvider>,
    cache: Mutex<ShareCache>,
    state: Mutex<ConnectionState>,
    /// Serializes the mount handshake.
    mount_gate: tokio::sync::Mutex<()>,
    permissions: AtomicU32,
}

impl ShareVolume {
    pub fn create(
        manager: &Arc<VolumeManager>,
        server_info: Arc<ExtendedServerInfo>,
        provider: Arc<ServerConnectionProvider>,
        share_name: &str,
    ) -> Result<(Arc<ShareVolume>, VolumeRef)> {
        let id = manager.new_volume_id();
        let root_id = manager.new_node_id(id)?;
        let volume = Arc::new_cyclic(|weak: &Weak<ShareVolume>| {
            let this: Weak<dyn Volume> = weak.clone();
            ShareVolume {
                base: VolumeBase::new(manager, id, share_name, this),
                root_id,
                this: weak.clone(),
                server_info: Mutex::new(server_info),
                provider,
                cache: Mutex::new(ShareCache::new(manager.clone(), id, root_id)),
                state: Mutex::new(ConnectionState::NotInitialized),
                mount_gate: tokio::sync::Mutex::new(()),
                permissions: AtomicU32::new(0),
            }
        });
        match manager.add_volume(volume.clone()) {
            Ok(vref) => Ok((volume, vref)),
            Err(err) => {
                manager.remove_node_id(root_id);
                Err(err)
            }
        }
    }

    pub fn share_name(&self) -> &str {
        self.base.name()
    }

    pub fn server_info(&self) -> Arc<ExtendedServerInfo> {
        self.server_info.lock().clone()
    }

    pub fn set_server_info(&self, info: Arc<ExtendedServerInfo>) {
        *self.server_info.lock() = info;
    }

    pub fn is_read_only(&self) -> bool {
        self.base.manager().config().mount.read_only
    }

    pub fn supports_queries(&self) -> bool {
        self.permissions.load(Ordering::Acquire) & share_permissions::QUERY != 0
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.lock(), ConnectionState::Ready(_))
    }

    /// The server's id for this share, once mounted.
    pub fn remote_volume_id(&self) -> Option<RemoteVolumeId> {
        match &*self.state.lock() {
            ConnectionState::Ready(session) => Some(session.volume_id),
            _ => None,
        }
    }

    // ── connection ─────────────────────────────────────────────────────

    fn session(&self) -> Result<Option<Session>> {
        match &*self.state.lock() {
            ConnectionState::NotInitialized => Ok(None),
            ConnectionState::Ready(session) => Ok(Some(session.clone())),
            ConnectionState::Closed => Err(not_connected()),
        }
    }

    /// Mount the share on first use. A failed mount closes the share for
    /// good: the failing call sees `PERMISSION_DENIED`, later ones
    /// `NOT_CONNECTED`.
    async fn ensure_mounted(&self) -> Result<Session> {
        if self.base.is_unmounting() {
            return Err(not_connected());
        }
        if let Some(session) = self.session()? {
            return Ok(session);
        }
        let _gate = self.mount_gate.lock().await;
        if let Some(session) = self.session()? {
            return Ok(session);
        }
        match self.mount_share().await {
            Ok(session) => Ok(session),
            Err(err) => {
                *self.state.lock() = ConnectionState::Closed;
                tracing::warn!(share = self.base.name(), %err, "mounting share failed");
                Err(Status::with_message(FsCode::PERMISSION_DENIED, err.describe()))
            }
        }
    }

    async fn mount_share(&self) -> Result<Session> {
        let manager = self.base.manager().clone();
        let connection = self.provider.get_server_connection(&manager).await?;
        let server = self.server_info.lock().display_name();
        let share = self.base.name().to_owned();
        let uid = manager.config().mount.uid;

        let mut bad_password = false;
        let reply = loop {
            let credentials = manager
                .credentials()
                .get_authentication(&server, &share, uid, bad_password)
                .await?
                .ok_or_else(|| {
                    Status::with_message(ServerCode::AUTHENTICATION_CANCELLED, format!("mounting {share} cancelled"))
                })?;
            let request = MountRequest {
                share: share.clone(),
                user: Some(credentials.user),
                password: Some(credentials.password),
                flags: 0,
            };
            let reply: MountReply = connection.request(request).await?;
            if reply.no_permission {
                bad_password = true;
                continue;
            }
            break reply.into_result()?;
        };

        self.permissions.store(reply.share_permissions, Ordering::Release);
        self.cache.lock().map_root(&reply.node_info)?;
        connection.add_volume(reply.volume_id, self.this.clone());
        let session = Session {
            connection,
            volume_id: reply.volume_id,
        };
        *self.state.lock() = ConnectionState::Ready(session.clone());
        tracing::info!(
            server = %server,
            share = %share,
            remote_volume = %reply.volume_id,
            permissions = reply.share_permissions,
            "share mounted"
        );
        Ok(session)
    }

    /// The server connection went away; no further requests are made.
    pub fn connection_closed(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Closed);
        if let ConnectionState::Ready(session) = previous {
            tracing::info!(share = self.base.name(), remote_volume = %session.volume_id, "share disconnected");
        }
    }

    // ── helpers ────────────────────────────────────────────────────────

    fn remote_id(&self, node: LocalNodeId) -> Result<RemoteNodeId> {
        self.cache
            .lock()
            .remote_id(node)
            .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no remote node for {node}")))
    }

    fn dir_remote_id(&self, dir: LocalNodeId) -> Result<RemoteNodeId> {
        let cache = self.cache.lock();
        let node = cache
            .node(dir)
            .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no node {dir}")))?;
        if !node.is_dir() {
            return Err(Status::new(FsCode::NOT_A_DIRECTORY));
        }
        cache
            .remote_id(dir)
            .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no remote node for {dir}")))
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Status::with_message(FsCode::PERMISSION_DENIED, "read-only mount"));
        }
        Ok(())
    }

    /// Mutations of a directory the host already removed are refused.
    fn check_dir_alive(&self, dir: LocalNodeId) -> Result<()> {
        if self.base.is_vnode_removed(dir) {
            return Err(Status::new(FsCode::NOT_ALLOWED));
        }
        Ok(())
    }

    fn update_node(&self, info: &NodeInfo) {
        if let Err(err) = self.cache.lock().update_node(info) {
            tracing::trace!(node = %info.node_id, %err, "node info not applied");
        }
    }

    async fn close_cookie(&self, session: &Session, cookie: Cookie) -> Result<()> {
        session
            .connection
            .call_status(CloseRequest {
                volume_id: session.volume_id,
                cookie,
            })
            .await
    }

    async fn walk_remote(&self, session: &Session, dir: RemoteNodeId, name: &str, resolve_link: bool) -> Result<WalkReply> {
        session
            .connection
            .call(WalkRequest {
                volume_id: session.volume_id,
                node_id: dir,
                name: name.to_owned(),
                resolve_link,
            })
            .await
    }

    /// Load `info` into `dir`, walking again for as long as the info is
    /// already obsolete.
    async fn load_fresh_entry(&self, session: &Session, dir: LocalNodeId, mut info: EntryInfo) -> Result<LocalNodeId> {
        for _ in 0..MAX_REFETCH {
            {
                let mut cache = self.cache.lock();
                if !cache.is_obsolete(&info) {
                    return cache.load_entry(dir, &info);
                }
            }
            let reply = self.walk_remote(session, info.directory_id, &info.name, false).await?;
            info = reply.entry_info;
        }
        Err(stale_entry(&info.name))
    }

    /// Fetch the next page of a server listing into `iterator`.
    async fn read_remote_dir(&self, session: &Session, dir: LocalNodeId, iterator: &mut ShareDirIterator) -> Result<()> {
        let Some(listing) = iterator.listing.as_ref() else {
            return Ok(());
        };
        let request = ReadDirRequest {
            volume_id: session.volume_id,
            cookie: listing.cookie,
            count: READ_DIR_PAGE,
            rewind: listing.rewind,
        };
        let rewind = listing.rewind;
        let reply: ReadDirReply = session.connection.call(request).await?;
        let dir_remote = self.remote_id(dir)?;

        let mut infos = reply.entry_infos;
        let mut attempts = 0;
        loop {
            let obsolete = {
                let cache = self.cache.lock();
                infos.iter().any(|info| cache.is_obsolete(info))
            };
            if !obsolete {
                break;
            }
            attempts += 1;
            if attempts > MAX_REFETCH {
                return Err(stale_entry("directory page"));
            }
            let names = infos.iter().map(|info| info.name.clone()).collect();
            let walked: MultiWalkReply = session
                .connection
                .call(MultiWalkRequest {
                    volume_id: session.volume_id,
                    node_id: dir_remote,
                    names,
                })
                .await?;
            infos = walked.entry_infos;
        }

        let mut cache = self.cache.lock();
        let Some(listing) = iterator.listing.as_mut() else {
            return Ok(());
        };
        if rewind || listing.revision < Revision(0) {
            listing.revision = reply.revision;
        }
        listing.rewind = false;
        listing.done = reply.done;
        let revision = listing.revision;
        iterator.names.clear();
        iterator.index = 0;
        for info in &infos {
            if info.name.is_empty() {
                return Err(Status::with_message(RPCCode::BAD_DATA, "unnamed directory entry"));
            }
            cache.load_entry(dir, info)?;
            iterator.names.push(info.name.clone());
        }
        let unchanged = cache
            .dir_state(dir)
            .is_some_and(|state| state.entry_removed_revision < revision);
        if reply.done && unchanged {
            cache.set_complete(dir, true);
        }
        Ok(())
    }

    /// Resolve one entry of a server query to local ids.
    pub async fn get_query_entry(&self, entry_info: &EntryInfo, dir_info: &NodeInfo) -> Result<DirEntry> {
        if entry_info.name.is_empty() {
            return Err(Status::with_message(RPCCode::BAD_DATA, "unnamed query entry"));
        }
        let session = self.ensure_mounted().await?;
        let dir = {
            let mut cache = self.cache.lock();
            let dir = cache.load_node(dir_info)?;
            if !cache.node(dir).is_some_and(|n| n.is_dir()) {
                return Err(Status::with_message(FsCode::ENTRY_NOT_FOUND, "query entry parent is not a directory"));
            }
            dir
        };
        let node = self.load_fresh_entry(&session, dir, entry_info.clone()).await?;
        let dev = self.base.mount_id();
        Ok(DirEntry {
            dev,
            ino: node,
            parent_dev: dev,
            parent_ino: dir,
            name: entry_info.name.clone(),
        })
    }

    // ── node monitoring ────────────────────────────────────────────────

    /// Apply one node-monitoring request from the server and pass it on to
    /// the host in local ids.
    pub async fn handle_monitor_request(&self, request: Request) -> Result<()> {
        match request {
            Request::EntryCreated(r) => self.entry_created_event(r),
            Request::EntryRemoved(r) => self.entry_removed_event(r),
            Request::EntryMoved(r) => self.entry_moved_event(r),
            Request::StatChanged(r) => self.stat_changed_event(r),
            Request::AttributeChanged(r) => self.attribute_changed_event(r),
            other => {
                return Err(Status::with_message(
                    RPCCode::BAD_DATA,
                    format!("{} is not a monitor request", other.kind()),
                ));
            }
        }
        Ok(())
    }

    fn send_query_update(&self, header: &MonitorHeader, dir: LocalNodeId, node: LocalNodeId, name: &str) {
        self.base.vfs().send_notification(
            header.port,
            header.token,
            NodeMonitorEvent {
                opcode: header.opcode,
                device: self.base.mount_id(),
                directory: dir,
                to_directory: dir,
                node,
                name: Some(name.to_owned()),
            },
        );
    }

    fn entry_created_event(&self, r: EntryCreatedRequest) {
        let header = &r.header;
        let mut cache = self.cache.lock();
        if header.query_update {
            let dir = cache.local_id(r.directory_id, true);
            let node = cache.local_id(header.node_id, true);
            drop(cache);
            if let (Ok(dir), Ok(node)) = (dir, node) {
                self.send_query_update(header, dir, node, &r.name);
            }
            return;
        }
        let Some(dir) = cache.known_local_id(r.directory_id) else {
            tracing::trace!(dir = %r.directory_id, name = %r.name, "entry created in unknown directory");
            return;
        };
        let info = r.entry_info_valid.then_some(&r.entry_info);
        cache.entry_created(r.directory_id, &r.name, info, header.revision);
        let node = cache.local_id(header.node_id, true);
        drop(cache);
        if let Ok(node) = node {
            self.base
                .notify_listener(MonitorOpcode::EntryCreated, dir, dir, node, Some(&r.name));
        }
    }

    fn entry_removed_event(&self, r: EntryRemovedRequest) {
        let header = &r.header;
        let mut cache = self.cache.lock();
        if header.query_update {
            let dir = cache.local_id(r.directory_id, true);
            let node = cache.known_local_id(header.node_id);
            drop(cache);
            if let (Ok(dir), Some(node)) = (dir, node) {
                self.send_query_update(header, dir, node, &r.name);
            }
            return;
        }
        let Some(dir) = cache.known_local_id(r.directory_id) else {
            tracing::trace!(dir = %r.directory_id, name = %r.name, "entry removed from unknown directory");
            return;
        };
        // Translate before the node and its id are dropped.
        let node = cache.known_local_id(header.node_id);
        cache.entry_removed(r.directory_id, &r.name, header.revision);
        cache.node_removed(header.node_id);
        drop(cache);
        if let Some(node) = node {
            self.base
                .notify_listener(MonitorOpcode::EntryRemoved, dir, dir, node, Some(&r.name));
        }
    }

    fn entry_moved_event(&self, r: EntryMovedRequest) {
        let header = &r.header;
        if header.query_update {
            return;
        }
        let mut cache = self.cache.lock();
        let from = cache.known_local_id(r.from_directory_id);
        let to = cache.known_local_id(r.to_directory_id);
        let info = r.entry_info_valid.then_some(&r.entry_info);
        cache.entry_moved(
            r.from_directory_id,
            &r.from_name,
            r.to_directory_id,
            &r.to_name,
            info,
            header.revision,
        );
        let (Some(from), Some(to)) = (from, to) else {
            tracing::trace!(from = %r.from_directory_id, to = %r.to_directory_id, "entry moved between unknown directories");
            return;
        };
        let node = cache.local_id(header.node_id, true);
        drop(cache);
        if let Ok(node) = node {
            self.base
                .notify_listener(MonitorOpcode::EntryMoved, from, to, node, Some(&r.to_name));
        }
    }

    fn stat_changed_event(&self, r: StatChangedRequest) {
        if r.header.query_update {
            return;
        }
        let mut cache = self.cache.lock();
        let Some(node) = cache.known_local_id(r.header.node_id) else {
            return;
        };
        if let Err(err) = cache.update_node(&r.node_info) {
            tracing::trace!(%node, %err, "stat change not applied");
        }
        drop(cache);
        self.base
            .notify_listener(MonitorOpcode::StatChanged, LocalNodeId::default(), LocalNodeId::default(), node, None);
    }

    fn attribute_changed_event(&self, r: AttributeChangedRequest) {
        if r.header.query_update {
            return;
        }
        let mut cache = self.cache.lock();
        let Some(node) = cache.known_local_id(r.header.node_id) else {
            return;
        };
        cache.update_attr_dir(r.header.node_id, &r.attr_dir_info);
        drop(cache);
        self.base.notify_listener(
            MonitorOpcode::AttrChanged,
            LocalNodeId::default(),
            LocalNodeId::default(),
            node,
            Some(&r.attr_info.name),
        );
    }

    /// Invalidate the cached attribute directory after a local change made
    /// against `revision`.
    fn attr_dir_changed(&self, node: LocalNodeId, revision: Option<Revision>) {
        if let Some(revision) = revision {
            self.cache.lock().invalidate_attr_dir(node, revision);
        }
    }
}

#[async_trait]
impl Volume for ShareVolume {
    fn base(&self) -> &VolumeBase {
        &self.base
    }

    fn root_id(&self) -> LocalNodeId {
        self.root_id
    }

    fn as_share(&self) -> Option<&ShareVolume> {
        Some(self)
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    fn prepare_to_unmount(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Closed);
        let held = self.cache.lock().prepare_to_unmount();
        tracing::debug!(share = self.base.name(), held = held.len(), "dropping share nodes");
        for id in held {
            if let Err(err) = self.base.vfs().remove_vnode(id) {
                tracing::debug!(node = %id, %err, "vnode already gone");
                self.cache.lock().drop_node(id);
            }
        }
        if let ConnectionState::Ready(session) = previous {
            session.connection.remove_volume(session.volume_id);
        }
        self.base.manager().query_manager().volume_unmounting(self.root_id);
    }

    fn remove_child_volume(&self, child: &dyn Volume) {
        tracing::warn!(share = self.base.name(), child = child.base().name(), "share volumes have no children");
    }

    fn uninit(&self) {
        self.cache.lock().uninit();
    }

    async fn unmount(&self) {
        let Ok(Some(session)) = self.session() else {
            return;
        };
        let request = UnmountRequest {
            volume_id: session.volume_id,
        };
        if let Err(err) = session.connection.call_status(request).await {
            tracing::debug!(share = self.base.name(), %err, "unmount request failed");
        }
    }

    async fn handle_event(&self, event: VolumeEvent) {
        match event {
            VolumeEvent::ConnectionBroken { .. } => self.connection_closed(),
        }
    }

    // ── vnodes ─────────────────────────────────────────────────────────

    async fn read_vnode(&self, id: LocalNodeId) -> Result<()> {
        {
            let mut cache = self.cache.lock();
            if cache.set_known_to_vfs(id, true) {
                return Ok(());
            }
        }
        let session = self.ensure_mounted().await?;
        let remote = self.remote_id(id)?;
        let reply: ReadVNodeReply = session
            .connection
            .call(ReadVNodeRequest {
                volume_id: session.volume_id,
                node_id: remote,
            })
            .await?;
        let mut cache = self.cache.lock();
        let local = cache.load_node(&reply.node_info)?;
        cache.set_known_to_vfs(local, true);
        Ok(())
    }

    fn write_vnode(&self, id: LocalNodeId) {
        self.cache.lock().set_known_to_vfs(id, false);
    }

    fn remove_vnode(&self, id: LocalNodeId) {
        self.cache.lock().drop_node(id);
    }

    // ── nodes ──────────────────────────────────────────────────────────

    async fn read_stat(&self, node: LocalNodeId) -> Result<Stat> {
        let mount = &self.base.manager().config().mount;
        let cache = self.cache.lock();
        let cached = cache
            .node(node)
            .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no node {node}")))?;
        let mut stat = Stat::from_node_stat(self.base.mount_id(), node, &cached.info.stat);
        stat.uid = mount.uid;
        stat.gid = mount.gid;
        Ok(stat)
    }

    async fn write_stat(&self, node: LocalNodeId, stat: &Stat, mask: u32) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        let remote = self.remote_id(node)?;
        let request = WriteStatRequest {
            volume_id: session.volume_id,
            node_id: remote,
            node_info: NodeInfo {
                node_id: remote,
                stat: stat.to_node_stat(),
                revision: Revision::NONE,
            },
            mask,
        };
        let reply: WriteStatReply = session.connection.request(request).await?;
        if reply.node_info_valid {
            self.update_node(&reply.node_info);
        }
        reply.into_result().map(drop)
    }

    // ── files ──────────────────────────────────────────────────────────

    async fn create(&self, dir: LocalNodeId, name: &str, open_mode: i32, mode: u32) -> Result<(LocalNodeId, FileCookie)> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        self.check_dir_alive(dir)?;
        let dir_remote = self.dir_remote_id(dir)?;
        let reply: CreateFileReply = session
            .connection
            .call(CreateFileRequest {
                volume_id: session.volume_id,
                directory_id: dir_remote,
                name: name.to_owned(),
                open_mode,
                mode,
            })
            .await?;
        let cookie = reply.cookie;

        let loaded = match self.load_fresh_entry(&session, dir, reply.entry_info).await {
            Ok(node) => self.base.vfs().get_vnode(node).await.map(|()| node),
            Err(err) => Err(err),
        };
        match loaded {
            Ok(node) => Ok((node, cookie)),
            Err(err) => {
                if let Err(close_err) = self.close_cookie(&session, cookie).await {
                    tracing::debug!(%close_err, "closing created file failed");
                }
                Err(err)
            }
        }
    }

    async fn open(&self, node: LocalNodeId, mut mode: i32) -> Result<FileCookie> {
        let session = self.ensure_mounted().await?;
        if self.is_read_only() {
            let access = mode & open_mode::ACCMODE;
            if access == open_mode::WRONLY || mode & open_mode::TRUNC != 0 {
                return Err(Status::with_message(FsCode::PERMISSION_DENIED, "read-only mount"));
            }
            if access == open_mode::RDWR {
                mode = (mode & !open_mode::ACCMODE) | open_mode::RDONLY;
            }
        }
        let remote = self.remote_id(node)?;
        let reply: OpenReply = session
            .connection
            .call(OpenRequest {
                volume_id: session.volume_id,
                node_id: remote,
                open_mode: mode,
            })
            .await?;
        self.update_node(&reply.node_info);
        Ok(reply.cookie)
    }

    async fn free_cookie(&self, _node: LocalNodeId, cookie: FileCookie) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.close_cookie(&session, cookie).await
    }

    async fn read(&self, _node: LocalNodeId, cookie: FileCookie, pos: i64, size: usize) -> Result<Vec<u8>> {
        let session = self.ensure_mounted().await?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let size = size.min(i32::MAX as usize);
        let request = ReadRequest {
            volume_id: session.volume_id,
            cookie,
            pos,
            size: wire_size(size),
        };
        let mut read = StreamedRead::new(pos, size);
        session
            .connection
            .stream::<ReadReply, _>(request, |part| read.accept(part.pos, part.data))
            .await?;
        Ok(read.data)
    }

    async fn write(&self, _node: LocalNodeId, cookie: FileCookie, pos: i64, data: &[u8]) -> Result<usize> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        let mut written = 0;
        for chunk in data.chunks(MAX_WRITE_SIZE) {
            session
                .connection
                .call_status(WriteRequest {
                    volume_id: session.volume_id,
                    cookie,
                    pos: pos + written as i64,
                    data: chunk.to_vec(),
                })
                .await?;
            written += chunk.len();
        }
        Ok(written)
    }

    // ── links ──────────────────────────────────────────────────────────

    async fn link(&self, dir: LocalNodeId, name: &str, node: LocalNodeId) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        self.check_dir_alive(dir)?;
        let dir_remote = self.dir_remote_id(dir)?;
        let node_remote = self.remote_id(node)?;
        session
            .connection
            .call_status(CreateLinkRequest {
                volume_id: session.volume_id,
                directory_id: dir_remote,
                name: name.to_owned(),
                node_id: node_remote,
            })
            .await
    }

    async fn unlink(&self, dir: LocalNodeId, name: &str) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        let dir_remote = self.dir_remote_id(dir)?;
        session
            .connection
            .call_status(UnlinkRequest {
                volume_id: session.volume_id,
                directory_id: dir_remote,
                name: name.to_owned(),
            })
            .await
    }

    async fn symlink(&self, dir: LocalNodeId, name: &str, target: &str) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        self.check_dir_alive(dir)?;
        let dir_remote = self.dir_remote_id(dir)?;
        session
            .connection
            .call_status(CreateSymlinkRequest {
                volume_id: session.volume_id,
                directory_id: dir_remote,
                name: name.to_owned(),
                target: target.to_owned(),
            })
            .await
    }

    async fn read_link(&self, node: LocalNodeId, max_size: usize) -> Result<Vec<u8>> {
        let session = self.ensure_mounted().await?;
        let remote = self.remote_id(node)?;
        let reply: ReadLinkReply = session
            .connection
            .call(ReadLinkRequest {
                volume_id: session.volume_id,
                node_id: remote,
                max_size: wire_size(max_size),
            })
            .await?;
        self.update_node(&reply.node_info);
        if reply.data.len() > max_size {
            return Err(Status::with_message(RPCCode::BAD_DATA, "link target longer than asked for"));
        }
        Ok(reply.data)
    }

    async fn rename(&self, old_dir: LocalNodeId, old_name: &str, new_dir: LocalNodeId, new_name: &str) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        self.check_dir_alive(new_dir)?;
        let old_remote = self.dir_remote_id(old_dir)?;
        let new_remote = self.dir_remote_id(new_dir)?;
        session
            .connection
            .call_status(RenameRequest {
                volume_id: session.volume_id,
                old_directory_id: old_remote,
                old_name: old_name.to_owned(),
                new_directory_id: new_remote,
                new_name: new_name.to_owned(),
            })
            .await
    }

    // ── directories ────────────────────────────────────────────────────

    async fn mkdir(&self, dir: LocalNodeId, name: &str, mode: u32) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        self.check_dir_alive(dir)?;
        let dir_remote = self.dir_remote_id(dir)?;
        session
            .connection
            .call_status(MakeDirRequest {
                volume_id: session.volume_id,
                directory_id: dir_remote,
                name: name.to_owned(),
                mode,
            })
            .await
    }

    async fn rmdir(&self, dir: LocalNodeId, name: &str) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        let dir_remote = self.dir_remote_id(dir)?;
        session
            .connection
            .call_status(RemoveDirRequest {
                volume_id: session.volume_id,
                directory_id: dir_remote,
                name: name.to_owned(),
            })
            .await
    }

    async fn open_dir(&self, node: LocalNodeId) -> Result<DirCookie> {
        let session = self.ensure_mounted().await?;
        let remote = {
            let cache = self.cache.lock();
            let dir = cache
                .node(node)
                .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no node {node}")))?;
            if !dir.is_dir() {
                return Err(Status::new(FsCode::NOT_A_DIRECTORY));
            }
            if cache.is_complete(node) {
                return Ok(DirCookie::Share(ShareDirIterator::local(cache.dir_names(node))));
            }
            dir.remote_id()
        };
        let reply: OpenDirReply = session
            .connection
            .call(OpenDirRequest {
                volume_id: session.volume_id,
                node_id: remote,
            })
            .await?;
        self.update_node(&reply.node_info);
        Ok(DirCookie::Share(ShareDirIterator::remote(reply.cookie)))
    }

    async fn free_dir_cookie(&self, _node: LocalNodeId, cookie: DirCookie) -> Result<()> {
        let DirCookie::Share(iterator) = cookie else {
            return Err(foreign_cookie());
        };
        let Some(listing) = iterator.listing else {
            return Ok(());
        };
        let session = self.ensure_mounted().await?;
        self.close_cookie(&session, listing.cookie).await
    }

    async fn read_dir(&self, node: LocalNodeId, cookie: &mut DirCookie, count: usize) -> Result<Vec<DirEntry>> {
        let DirCookie::Share(iterator) = cookie else {
            return Err(foreign_cookie());
        };
        let session = self.ensure_mounted().await?;
        let mut entries = Vec::new();
        if count == 0 {
            return Ok(entries);
        }
        let dev = self.base.mount_id();
        let parent_root = if node == self.root_id {
            self.base.parent_root_id()
        } else {
            None
        };

        loop {
            {
                let cache = self.cache.lock();
                while let Some(name) = iterator.names.get(iterator.index).cloned() {
                    iterator.index += 1;
                    // Re-resolve: the entry may be gone by now.
                    let Some(entry) = cache.entry(node, &name) else {
                        continue;
                    };
                    let ino = match parent_root {
                        Some(parent) if name == ".." => parent,
                        _ => entry.node,
                    };
                    entries.push(DirEntry {
                        dev,
                        ino,
                        parent_dev: dev,
                        parent_ino: node,
                        name,
                    });
                    if entries.len() >= count {
                        return Ok(entries);
                    }
                }
            }
            if iterator.is_done() {
                return Ok(entries);
            }
            self.read_remote_dir(&session, node, iterator).await?;
            if iterator.names.is_empty() && !iterator.is_done() {
                return Err(Status::with_message(RPCCode::BAD_DATA, "empty directory page"));
            }
        }
    }

    async fn rewind_dir(&self, node: LocalNodeId, cookie: &mut DirCookie) -> Result<()> {
        let DirCookie::Share(iterator) = cookie else {
            return Err(foreign_cookie());
        };
        iterator.index = 0;
        match iterator.listing.as_mut() {
            Some(listing) => {
                iterator.names.clear();
                listing.rewind = true;
                listing.done = false;
            }
            None => iterator.names = self.cache.lock().dir_names(node),
        }
        Ok(())
    }

    async fn walk(&self, dir: LocalNodeId, name: &str, resolve_link: bool) -> Result<WalkResult> {
        if dir == self.root_id && is_dot_name(name) {
            let node = match name {
                "." => self.root_id,
                _ => self.base.parent_root_id().unwrap_or(self.root_id),
            };
            self.base.vfs().get_vnode(node).await?;
            return Ok(WalkResult {
                node,
                resolved_path: None,
            });
        }

        let session = self.ensure_mounted().await?;
        let cached = {
            let cache = self.cache.lock();
            let dir_node = cache
                .node(dir)
                .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no node {dir}")))?;
            if !dir_node.is_dir() {
                return Err(Status::new(FsCode::NOT_A_DIRECTORY));
            }
            match cache.entry(dir, name) {
                Some(entry) => Ok(entry.node),
                None if cache.is_complete(dir) => {
                    return Err(Status::with_message(FsCode::ENTRY_NOT_FOUND, name.to_owned()));
                }
                None => Err(dir_node.remote_id()),
            }
        };
        let dir_remote = match cached {
            Ok(node) => {
                self.base.vfs().get_vnode(node).await?;
                return Ok(WalkResult {
                    node,
                    resolved_path: None,
                });
            }
            Err(dir_remote) => dir_remote,
        };

        for _ in 0..MAX_REFETCH {
            let reply = self.walk_remote(&session, dir_remote, name, resolve_link).await?;
            let node = {
                let mut cache = self.cache.lock();
                if cache.is_obsolete(&reply.entry_info) {
                    None
                } else {
                    Some(cache.load_entry(dir, &reply.entry_info)?)
                }
            };
            let Some(node) = node else {
                continue;
            };
            if let Some(path) = reply.link_path.filter(|_| resolve_link) {
                return Ok(WalkResult {
                    node,
                    resolved_path: Some(path),
                });
            }
            self.base.vfs().get_vnode(node).await?;
            return Ok(WalkResult {
                node,
                resolved_path: None,
            });
        }
        Err(stale_entry(name))
    }

    // ── attributes ─────────────────────────────────────────────────────

    async fn open_attr_dir(&self, node: LocalNodeId) -> Result<AttrDirCookie> {
        let session = self.ensure_mounted().await?;
        let remote = {
            let cache = self.cache.lock();
            if let Some(attr_dir) = cache.up_to_date_attr_dir(node) {
                return Ok(AttrDirCookie(AttrDirState::Local {
                    names: attr_dir.names(),
                    index: 0,
                }));
            }
            cache
                .remote_id(node)
                .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no remote node for {node}")))?
        };
        let reply: OpenAttrDirReply = session
            .connection
            .call(OpenAttrDirRequest {
                volume_id: session.volume_id,
                node_id: remote,
            })
            .await?;
        // Directories too big to ship are read through the cookie.
        if !reply.attr_dir_info.is_valid {
            return Ok(AttrDirCookie(AttrDirState::Remote {
                cookie: reply.cookie,
                rewind: false,
            }));
        }
        let mut cache = self.cache.lock();
        cache.load_attr_dir(node, &reply.attr_dir_info)?;
        let names = cache
            .node(node)
            .and_then(|n| n.attr_dir.as_ref())
            .map(|attr_dir| attr_dir.names())
            .unwrap_or_default();
        Ok(AttrDirCookie(AttrDirState::Local { names, index: 0 }))
    }

    async fn free_attr_dir_cookie(&self, _node: LocalNodeId, cookie: AttrDirCookie) -> Result<()> {
        let AttrDirState::Remote { cookie, .. } = cookie.0 else {
            return Ok(());
        };
        let session = self.ensure_mounted().await?;
        self.close_cookie(&session, cookie).await
    }

    async fn read_attr_dir(&self, _node: LocalNodeId, cookie: &mut AttrDirCookie) -> Result<Option<String>> {
        let session = self.ensure_mounted().await?;
        let (remote_cookie, rewind) = match &mut cookie.0 {
            AttrDirState::Local { names, index } => {
                let name = names.get(*index).cloned();
                if name.is_some() {
                    *index += 1;
                }
                return Ok(name);
            }
            AttrDirState::Remote { cookie, rewind } => (*cookie, rewind),
        };
        let reply: ReadAttrDirReply = session
            .connection
            .call(ReadAttrDirRequest {
                volume_id: session.volume_id,
                cookie: remote_cookie,
                count: 1,
                rewind: *rewind,
            })
            .await?;
        *rewind = false;
        if reply.count == 0 {
            return Ok(None);
        }
        if reply.name.is_empty() {
            return Err(Status::with_message(RPCCode::BAD_DATA, "unnamed attribute"));
        }
        Ok(Some(reply.name))
    }

    async fn rewind_attr_dir(&self, _node: LocalNodeId, cookie: &mut AttrDirCookie) -> Result<()> {
        match &mut cookie.0 {
            AttrDirState::Local { index, .. } => *index = 0,
            AttrDirState::Remote { rewind, .. } => *rewind = true,
        }
        Ok(())
    }

    async fn read_attr(&self, node: LocalNodeId, name: &str, type_code: u32, pos: i64, size: usize) -> Result<Vec<u8>> {
        let session = self.ensure_mounted().await?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let remote = {
            let cache = self.cache.lock();
            if let Some(attr_dir) = cache.up_to_date_attr_dir(node) {
                let attribute = attr_dir
                    .attribute(name)
                    .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, name.to_owned()))?;
                if let Some(data) = &attribute.data {
                    let start = usize::try_from(pos.max(0)).unwrap_or(usize::MAX);
                    if start >= data.len() {
                        return Ok(Vec::new());
                    }
                    let end = data.len().min(start.saturating_add(size));
                    return Ok(data[start..end].to_vec());
                }
            }
            cache
                .remote_id(node)
                .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no remote node for {node}")))?
        };
        let size = size.min(i32::MAX as usize);
        let request = ReadAttrRequest {
            volume_id: session.volume_id,
            node_id: remote,
            name: name.to_owned(),
            type_code,
            pos,
            size: wire_size(size),
        };
        let mut read = StreamedRead::new(pos, size);
        session
            .connection
            .stream::<ReadAttrReply, _>(request, |part| read.accept(part.pos, part.data))
            .await?;
        Ok(read.data)
    }

    async fn write_attr(&self, node: LocalNodeId, name: &str, type_code: u32, pos: i64, data: &[u8]) -> Result<usize> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        let remote = self.remote_id(node)?;
        let mut written = 0;
        for chunk in data.chunks(MAX_WRITE_SIZE) {
            let revision = self.cache.lock().attr_dir_revision(node);
            session
                .connection
                .call_status(WriteAttrRequest {
                    volume_id: session.volume_id,
                    node_id: remote,
                    name: name.to_owned(),
                    type_code,
                    pos: pos + written as i64,
                    data: chunk.to_vec(),
                })
                .await?;
            written += chunk.len();
            self.attr_dir_changed(node, revision);
        }
        Ok(written)
    }

    async fn remove_attr(&self, node: LocalNodeId, name: &str) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        let remote = self.remote_id(node)?;
        let revision = self.cache.lock().attr_dir_revision(node);
        session
            .connection
            .call_status(RemoveAttrRequest {
                volume_id: session.volume_id,
                node_id: remote,
                name: name.to_owned(),
            })
            .await?;
        self.attr_dir_changed(node, revision);
        Ok(())
    }

    async fn rename_attr(&self, node: LocalNodeId, old_name: &str, new_name: &str) -> Result<()> {
        let session = self.ensure_mounted().await?;
        self.check_writable()?;
        let remote = self.remote_id(node)?;
        let revision = self.cache.lock().attr_dir_revision(node);
        session
            .connection
            .call_status(RenameAttrRequest {
                volume_id: session.volume_id,
                node_id: remote,
                old_name: old_name.to_owned(),
                new_name: new_name.to_owned(),
            })
            .await?;
        self.attr_dir_changed(node, revision);
        Ok(())
    }

    async fn stat_attr(&self, node: LocalNodeId, name: &str) -> Result<AttrStat> {
        let session = self.ensure_mounted().await?;
        let remote = {
            let cache = self.cache.lock();
            if let Some(attr_dir) = cache.up_to_date_attr_dir(node) {
                let attribute = attr_dir
                    .attribute(name)
                    .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, name.to_owned()))?;
                return Ok(AttrStat {
                    type_code: attribute.type_code,
                    size: attribute.size,
                });
            }
            cache
                .remote_id(node)
                .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no remote node for {node}")))?
        };
        let reply: StatAttrReply = session
            .connection
            .call(StatAttrRequest {
                volume_id: session.volume_id,
                node_id: remote,
                name: name.to_owned(),
            })
            .await?;
        Ok(AttrStat {
            type_code: reply.attr_info.type_code,
            size: reply.attr_info.size,
        })
    }
}

impl std::fmt::Debug for ShareVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareVolume")
            .field("base", &self.base)
            .field("root", &self.root_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}
