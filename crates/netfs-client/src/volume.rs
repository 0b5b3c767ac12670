//! The volume abstraction shared by the root, server and share volumes.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use netfs_proto::{Cookie, MonitorOpcode, NodeStat};
use netfs_types::{FsCode, LocalNodeId, MountId, Result, Status, VolumeId};
use parking_lot::Mutex;

use crate::query_manager::QueryIteratorRef;
use crate::server_volume::ServerVolume;
use crate::share_volume::{AttrDirCookie, ShareDirIterator, ShareVolume};
use crate::vfs::{HostVfs, NodeMonitorEvent};
use crate::virtual_volume::VirtualDirIterator;
use crate::volume_manager::VolumeManager;

/// Work handed from a notification source to the event delivery task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEvent {
    /// The server connection under this share volume broke.
    ConnectionBroken { volume_id: VolumeId },
}

impl VolumeEvent {
    pub fn volume_id(&self) -> VolumeId {
        match self {
            VolumeEvent::ConnectionBroken { volume_id } => *volume_id,
        }
    }
}

/// Stat of a node in local terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub dev: MountId,
    pub ino: LocalNodeId,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub blksize: i32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub crtime: i64,
}

impl Stat {
    pub fn from_node_stat(dev: MountId, ino: LocalNodeId, st: &NodeStat) -> Self {
        Self {
            dev,
            ino,
            mode: st.mode,
            nlink: st.nlink,
            uid: st.uid,
            gid: st.gid,
            size: st.size,
            blksize: st.blksize,
            atime: st.atime,
            mtime: st.mtime,
            ctime: st.ctime,
            crtime: st.crtime,
        }
    }

    pub fn to_node_stat(&self) -> NodeStat {
        NodeStat {
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            blksize: self.blksize,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
        }
    }
}

/// One directory entry as returned by `read_dir` and `read_query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub dev: MountId,
    pub ino: LocalNodeId,
    pub parent_dev: MountId,
    pub parent_ino: LocalNodeId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrStat {
    pub type_code: u32,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkResult {
    pub node: LocalNodeId,
    /// Target of a resolved symlink. When set, no vnode reference was taken.
    pub resolved_path: Option<String>,
}

/// Open-directory state, owned by the caller between `read_dir` calls.
#[derive(Debug)]
pub enum DirCookie {
    Virtual(VirtualDirIterator),
    Share(ShareDirIterator),
}

/// Server handle of an open file.
pub type FileCookie = Cookie;

/// Identity, tree position, lifecycle flags and reference count of a volume.
pub struct VolumeBase {
    id: VolumeId,
    name: String,
    manager: Arc<VolumeManager>,
    this: Weak<dyn Volume>,
    parent: Mutex<Option<Weak<dyn Volume>>>,
    unmounting: AtomicBool,
    removed: AtomicBool,
    refs: AtomicUsize,
}

impl VolumeBase {
    /// A fresh volume holds one reference, which `VolumeManager::add_volume`
    /// hands back as a `VolumeRef`.
    pub fn new(
        manager: &Arc<VolumeManager>,
        id: VolumeId,
        name: impl Into<String>,
        this: Weak<dyn Volume>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            manager: manager.clone(),
            this,
            parent: Mutex::new(None),
            unmounting: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
        }
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &Arc<VolumeManager> {
        &self.manager
    }

    pub fn vfs(&self) -> &Arc<dyn HostVfs> {
        self.manager.vfs()
    }

    pub fn mount_id(&self) -> MountId {
        self.manager.mount_id()
    }

    /// The volume this base belongs to, while it is alive.
    pub fn this(&self) -> Option<Arc<dyn Volume>> {
        self.this.upgrade()
    }

    pub fn this_weak(&self) -> Weak<dyn Volume> {
        self.this.clone()
    }

    pub fn parent(&self) -> Option<Arc<dyn Volume>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_parent(&self, parent: Option<Weak<dyn Volume>>) {
        *self.parent.lock() = parent;
    }

    /// Root node of the parent volume, which `..` of our root refers to.
    pub fn parent_root_id(&self) -> Option<LocalNodeId> {
        self.parent().map(|p| p.root_id())
    }

    pub fn is_unmounting(&self) -> bool {
        self.unmounting.load(Ordering::Acquire)
    }

    pub fn set_unmounting(&self) {
        self.unmounting.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Returns true for the one caller that actually marked it.
    pub(crate) fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference and returns how many are left.
    pub(crate) fn release(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn is_vnode_removed(&self, id: LocalNodeId) -> bool {
        matches!(self.vfs().is_vnode_removed(id), Ok(true))
    }

    pub fn notify_listener(
        &self,
        opcode: MonitorOpcode,
        directory: LocalNodeId,
        to_directory: LocalNodeId,
        node: LocalNodeId,
        name: Option<&str>,
    ) {
        self.vfs().notify_listener(NodeMonitorEvent {
            opcode,
            device: self.mount_id(),
            directory,
            to_directory,
            node,
            name: name.map(str::to_owned),
        });
    }
}

impl fmt::Debug for VolumeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeBase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("unmounting", &self.is_unmounting())
            .field("removed", &self.is_removed())
            .field("refs", &self.ref_count())
            .finish()
    }
}

pub(crate) fn unsupported<T>() -> Result<T> {
    Err(Status::new(FsCode::NOT_SUPPORTED))
}

/// A mountable subtree. Implemented by `RootVolume`, `ServerVolume` and
/// `ShareVolume`; every filesystem operation a volume does not support
/// fails with `NOT_SUPPORTED`.
#[async_trait]
pub trait Volume: Send + Sync + 'static {
    fn base(&self) -> &VolumeBase;

    fn root_id(&self) -> LocalNodeId;

    fn as_server(&self) -> Option<&ServerVolume> {
        None
    }

    fn as_share(&self) -> Option<&ShareVolume> {
        None
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    /// Called once by `VolumeManager::put_volume` after the volume was
    /// marked unmounting. Never called with a volume lock held.
    fn prepare_to_unmount(&self);

    fn remove_child_volume(&self, _child: &dyn Volume) {}

    /// Teardown once the volume is removed and unreferenced.
    fn uninit(&self) {}

    /// Tell the server side we are going away.
    async fn unmount(&self) {}

    async fn handle_event(&self, event: VolumeEvent) {
        tracing::debug!(volume = %self.base().id(), ?event, "event ignored");
    }

    // ── vnodes ─────────────────────────────────────────────────────────

    async fn read_vnode(&self, id: LocalNodeId) -> Result<()>;

    fn write_vnode(&self, id: LocalNodeId);

    fn remove_vnode(&self, id: LocalNodeId);

    // ── nodes ──────────────────────────────────────────────────────────

    async fn read_stat(&self, node: LocalNodeId) -> Result<Stat>;

    async fn write_stat(&self, _node: LocalNodeId, _stat: &Stat, _mask: u32) -> Result<()> {
        unsupported()
    }

    async fn ioctl(&self, _node: LocalNodeId, _command: u32, _buffer: &[u8]) -> Result<()> {
        unsupported()
    }

    // ── files ──────────────────────────────────────────────────────────

    /// Returns the new node, referenced through the host VFS, and its
    /// open cookie.
    async fn create(
        &self,
        _dir: LocalNodeId,
        _name: &str,
        _open_mode: i32,
        _mode: u32,
    ) -> Result<(LocalNodeId, FileCookie)> {
        unsupported()
    }

    async fn open(&self, _node: LocalNodeId, _open_mode: i32) -> Result<FileCookie> {
        unsupported()
    }

    async fn free_cookie(&self, _node: LocalNodeId, _cookie: FileCookie) -> Result<()> {
        unsupported()
    }

    async fn read(&self, _node: LocalNodeId, _cookie: FileCookie, _pos: i64, _size: usize) -> Result<Vec<u8>> {
        unsupported()
    }

    async fn write(&self, _node: LocalNodeId, _cookie: FileCookie, _pos: i64, _data: &[u8]) -> Result<usize> {
        unsupported()
    }

    // ── links ──────────────────────────────────────────────────────────

    async fn link(&self, _dir: LocalNodeId, _name: &str, _node: LocalNodeId) -> Result<()> {
        unsupported()
    }

    async fn unlink(&self, _dir: LocalNodeId, _name: &str) -> Result<()> {
        unsupported()
    }

    async fn symlink(&self, _dir: LocalNodeId, _name: &str, _target: &str) -> Result<()> {
        unsupported()
    }

    async fn read_link(&self, _node: LocalNodeId, _max_size: usize) -> Result<Vec<u8>> {
        unsupported()
    }

    async fn rename(
        &self,
        _old_dir: LocalNodeId,
        _old_name: &str,
        _new_dir: LocalNodeId,
        _new_name: &str,
    ) -> Result<()> {
        unsupported()
    }

    // ── directories ────────────────────────────────────────────────────

    async fn mkdir(&self, _dir: LocalNodeId, _name: &str, _mode: u32) -> Result<()> {
        unsupported()
    }

    async fn rmdir(&self, _dir: LocalNodeId, _name: &str) -> Result<()> {
        unsupported()
    }

    async fn open_dir(&self, node: LocalNodeId) -> Result<DirCookie>;

    async fn free_dir_cookie(&self, _node: LocalNodeId, _cookie: DirCookie) -> Result<()> {
        Ok(())
    }

    /// Up to `count` entries; an empty result means the end was reached.
    async fn read_dir(&self, node: LocalNodeId, cookie: &mut DirCookie, count: usize) -> Result<Vec<DirEntry>>;

    async fn rewind_dir(&self, node: LocalNodeId, cookie: &mut DirCookie) -> Result<()>;

    /// Resolves `name` in `dir` and takes a host VFS reference on the result.
    async fn walk(&self, dir: LocalNodeId, name: &str, resolve_link: bool) -> Result<WalkResult>;

    // ── attributes ─────────────────────────────────────────────────────

    async fn open_attr_dir(&self, _node: LocalNodeId) -> Result<AttrDirCookie> {
        unsupported()
    }

    async fn free_attr_dir_cookie(&self, _node: LocalNodeId, _cookie: AttrDirCookie) -> Result<()> {
        unsupported()
    }

    /// The next attribute name, `None` at the end.
    async fn read_attr_dir(&self, _node: LocalNodeId, _cookie: &mut AttrDirCookie) -> Result<Option<String>> {
        unsupported()
    }

    async fn rewind_attr_dir(&self, _node: LocalNodeId, _cookie: &mut AttrDirCookie) -> Result<()> {
        unsupported()
    }

    async fn read_attr(
        &self,
        _node: LocalNodeId,
        _name: &str,
        _type_code: u32,
        _pos: i64,
        _size: usize,
    ) -> Result<Vec<u8>> {
        unsupported()
    }

    async fn write_attr(
        &self,
        _node: LocalNodeId,
        _name: &str,
        _type_code: u32,
        _pos: i64,
        _data: &[u8],
    ) -> Result<usize> {
        unsupported()
    }

    async fn remove_attr(&self, _node: LocalNodeId, _name: &str) -> Result<()> {
        unsupported()
    }

    async fn rename_attr(&self, _node: LocalNodeId, _old_name: &str, _new_name: &str) -> Result<()> {
        unsupported()
    }

    async fn stat_attr(&self, _node: LocalNodeId, _name: &str) -> Result<AttrStat> {
        unsupported()
    }

    // ── queries ────────────────────────────────────────────────────────

    async fn open_query(&self, _query: &str, _flags: u32, _port: i32, _token: i32) -> Result<QueryIteratorRef> {
        unsupported()
    }

    /// The next match, `None` once the query is drained.
    async fn read_query(&self, _iterator: &QueryIteratorRef) -> Result<Option<DirEntry>> {
        unsupported()
    }

    /// Release whatever the volume keeps for `iterator`. Called by the query
    /// manager once the last reference is gone.
    fn free_query_iterator(&self, _iterator: &crate::query_manager::QueryIterator) {}
}

/// One counted reference to a registered volume.
///
/// Dropping it is `VolumeManager::put_volume`, which may start unmounting
/// or tear the volume down; do not drop one while holding a volume lock.
pub struct VolumeRef {
    volume: Arc<dyn Volume>,
}

impl VolumeRef {
    /// Take over a reference that was already counted.
    pub(crate) fn adopt(volume: Arc<dyn Volume>) -> Self {
        Self { volume }
    }

    pub fn downgrade(&self) -> Weak<dyn Volume> {
        Arc::downgrade(&self.volume)
    }
}

impl Clone for VolumeRef {
    fn clone(&self) -> Self {
        self.volume.base().acquire();
        Self {
            volume: self.volume.clone(),
        }
    }
}

impl Drop for VolumeRef {
    fn drop(&mut self) {
        let manager = self.volume.base().manager().clone();
        manager.put_volume(&self.volume);
    }
}

impl Deref for VolumeRef {
    type Target = dyn Volume;

    fn deref(&self) -> &Self::Target {
        self.volume.as_ref()
    }
}

impl fmt::Debug for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VolumeRef").field(self.volume.base()).finish()
    }
}
