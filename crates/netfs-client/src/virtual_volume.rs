//! A synthetic directory volume whose entries are child volumes.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use netfs_proto::{MonitorOpcode, S_IFDIR};
use netfs_types::{FsCode, LocalNodeId, Result, Status, VolumeId};
use parking_lot::Mutex;

use crate::query_manager::{QueryIteratorKind, QueryIteratorRef};
use crate::volume::{DirCookie, DirEntry, Stat, Volume, VolumeBase, VolumeRef, WalkResult};
use crate::volume_manager::VolumeManager;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    Dot,
    DotDot,
    Children { last: Option<String> },
    Done,
}

/// Cursor over a virtual directory. Children are visited in name order and
/// observed live: one added behind the cursor is skipped, one added ahead
/// of it shows up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDirIterator {
    position: Position,
}

impl VirtualDirIterator {
    fn new() -> Self {
        Self { position: Position::Dot }
    }
}

#[derive(Default)]
struct State {
    children: BTreeMap<String, VolumeRef>,
    root_known: bool,
}

pub struct VirtualVolume {
    base: VolumeBase,
    root_id: LocalNodeId,
    created: i64,
    state: Mutex<State>,
}

impl VirtualVolume {
    fn new(manager: &Arc<VolumeManager>, id: VolumeId, name: &str, root_id: LocalNodeId, this: Weak<dyn Volume>) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);
        Self {
            base: VolumeBase::new(manager, id, name, this),
            root_id,
            created,
            state: Mutex::new(State::default()),
        }
    }

    /// Allocate ids, build the concrete volume around a fresh virtual core
    /// and register it.
    pub(crate) fn create<V: Volume>(
        manager: &Arc<VolumeManager>,
        name: &str,
        build: impl FnOnce(VirtualVolume) -> V,
    ) -> Result<(Arc<V>, VolumeRef)> {
        let id = manager.new_volume_id();
        let root_id = manager.new_node_id(id)?;
        let volume = Arc::new_cyclic(|weak: &Weak<V>| {
            let this: Weak<dyn Volume> = weak.clone();
            build(VirtualVolume::new(manager, id, name, root_id, this))
        });
        match manager.add_volume(volume.clone()) {
            Ok(vref) => Ok((volume, vref)),
            Err(err) => {
                manager.remove_node_id(root_id);
                Err(err)
            }
        }
    }

    pub fn base(&self) -> &VolumeBase {
        &self.base
    }

    pub fn root_id(&self) -> LocalNodeId {
        self.root_id
    }

    fn check_root(&self, node: LocalNodeId) -> Result<()> {
        if node == self.root_id {
            Ok(())
        } else {
            Err(Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("{node} is not a node of {}", self.base.name())))
        }
    }

    // ── children ───────────────────────────────────────────────────────

    /// Adopt `child` under its own name.
    pub fn add_child_volume(&self, child: VolumeRef) -> Result<()> {
        let name = child.base().name().to_owned();
        let child_root = child.root_id();
        let rejected = {
            let mut state = self.state.lock();
            if state.children.contains_key(&name) {
                Some(child)
            } else {
                child.base().set_parent(Some(self.base.this_weak()));
                state.children.insert(name.clone(), child);
                None
            }
        };
        if rejected.is_some() {
            drop(rejected);
            return Err(Status::with_message(FsCode::EXISTS, format!("{name} already exists")));
        }
        self.base
            .notify_listener(MonitorOpcode::EntryCreated, self.root_id, self.root_id, child_root, Some(&name));
        Ok(())
    }

    pub fn remove_child_volume(&self, child: &dyn Volume) {
        let name = child.base().name();
        let removed = {
            let mut state = self.state.lock();
            match state.children.get(name) {
                Some(existing) if existing.base().id() == child.base().id() => state.children.remove(name),
                _ => None,
            }
        };
        if let Some(removed) = removed {
            self.base.notify_listener(
                MonitorOpcode::EntryRemoved,
                self.root_id,
                self.root_id,
                removed.root_id(),
                Some(name),
            );
        }
    }

    pub fn children(&self) -> Vec<VolumeRef> {
        self.state.lock().children.values().cloned().collect()
    }

    pub fn child(&self, name: &str) -> Option<VolumeRef> {
        self.state.lock().children.get(name).cloned()
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    pub fn prepare_to_unmount(&self) {
        self.base.manager().query_manager().volume_unmounting(self.root_id);
        let (children, root_known) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.children), state.root_known)
        };
        for child in children.values() {
            child.base().set_unmounting();
        }
        drop(children);
        if root_known {
            if let Err(err) = self.base.vfs().remove_vnode(self.root_id) {
                tracing::debug!(volume = %self.base.id(), %err, "root vnode already gone");
            }
        }
    }

    pub async fn unmount(&self) {
        for child in self.children() {
            child.unmount().await;
        }
    }

    pub fn uninit(&self) {
        self.base.manager().remove_node_id(self.root_id);
    }

    // ── vnodes ─────────────────────────────────────────────────────────

    pub fn read_vnode(&self, id: LocalNodeId) -> Result<()> {
        self.check_root(id)?;
        let mut state = self.state.lock();
        if state.root_known {
            return Err(Status::with_message(FsCode::BUSY, "root vnode already loaded"));
        }
        state.root_known = true;
        Ok(())
    }

    pub fn write_vnode(&self, id: LocalNodeId) {
        if id == self.root_id {
            self.state.lock().root_known = false;
        }
    }

    pub fn remove_vnode(&self, id: LocalNodeId) {
        self.write_vnode(id)
    }

    pub fn read_stat(&self, node: LocalNodeId) -> Result<Stat> {
        self.check_root(node)?;
        let mount = &self.base.manager().config().mount;
        Ok(Stat {
            dev: self.base.mount_id(),
            ino: self.root_id,
            mode: S_IFDIR | 0o555,
            nlink: 1,
            uid: mount.uid,
            gid: mount.gid,
            size: 1,
            blksize: 1024,
            atime: self.created,
            mtime: self.created,
            ctime: self.created,
            crtime: self.created,
        })
    }

    // ── directory ──────────────────────────────────────────────────────

    fn dot_dot(&self) -> LocalNodeId {
        self.base.parent_root_id().unwrap_or(self.root_id)
    }

    pub fn open_dir(&self, node: LocalNodeId) -> Result<DirCookie> {
        self.check_root(node)?;
        Ok(DirCookie::Virtual(VirtualDirIterator::new()))
    }

    pub fn read_dir(&self, node: LocalNodeId, cookie: &mut DirCookie, count: usize) -> Result<Vec<DirEntry>> {
        self.check_root(node)?;
        let DirCookie::Virtual(iterator) = cookie else {
            return Err(Status::with_message(FsCode::BAD_VALUE, "foreign directory cookie"));
        };
        let dev = self.base.mount_id();
        let entry = |ino: LocalNodeId, name: &str| DirEntry {
            dev,
            ino,
            parent_dev: dev,
            parent_ino: self.root_id,
            name: name.to_owned(),
        };

        let mut entries = Vec::new();
        while entries.len() < count {
            match &iterator.position {
                Position::Dot => {
                    entries.push(entry(self.root_id, "."));
                    iterator.position = Position::DotDot;
                }
                Position::DotDot => {
                    entries.push(entry(self.dot_dot(), ".."));
                    iterator.position = Position::Children { last: None };
                }
                Position::Children { last } => {
                    let state = self.state.lock();
                    let lower = match last {
                        Some(last) => Bound::Excluded(last.as_str()),
                        None => Bound::Unbounded,
                    };
                    let next = state
                        .children
                        .range::<str, _>((lower, Bound::Unbounded))
                        .next()
                        .map(|(name, child)| (name.clone(), child.root_id()));
                    drop(state);
                    match next {
                        Some((name, ino)) => {
                            entries.push(entry(ino, &name));
                            iterator.position = Position::Children { last: Some(name) };
                        }
                        None => iterator.position = Position::Done,
                    }
                }
                Position::Done => break,
            }
        }
        Ok(entries)
    }

    pub fn rewind_dir(&self, node: LocalNodeId, cookie: &mut DirCookie) -> Result<()> {
        self.check_root(node)?;
        match cookie {
            DirCookie::Virtual(iterator) => {
                *iterator = VirtualDirIterator::new();
                Ok(())
            }
            _ => Err(Status::with_message(FsCode::BAD_VALUE, "foreign directory cookie")),
        }
    }

    pub async fn walk(&self, dir: LocalNodeId, name: &str) -> Result<WalkResult> {
        self.check_root(dir)?;
        let node = match name {
            "." => self.root_id,
            ".." => self.dot_dot(),
            _ => self
                .state
                .lock()
                .children
                .get(name)
                .map(|child| child.root_id())
                .ok_or_else(|| Status::with_message(FsCode::ENTRY_NOT_FOUND, name.to_owned()))?,
        };
        self.base.vfs().get_vnode(node).await?;
        Ok(WalkResult {
            node,
            resolved_path: None,
        })
    }

    // ── queries ────────────────────────────────────────────────────────

    /// A hierarchical iterator over the queries of all children. Children
    /// that cannot run the query are left out.
    pub async fn open_query(&self, query: &str, flags: u32, port: i32, token: i32) -> Result<QueryIteratorRef> {
        let query_manager = self.base.manager().query_manager().clone();
        let iterator = query_manager.add_iterator(self.base.this_weak(), self.root_id, QueryIteratorKind::Hierarchical);
        for child in self.children() {
            match child.open_query(query, flags, port, token).await {
                Ok(sub) => query_manager.add_sub_iterator(&iterator, &sub)?,
                Err(err) => {
                    tracing::debug!(volume = child.base().name(), %err, "child cannot run query");
                }
            }
        }
        Ok(iterator)
    }

    pub async fn read_query(&self, iterator: &QueryIteratorRef) -> Result<Option<DirEntry>> {
        let query_manager = self.base.manager().query_manager().clone();
        loop {
            let Some(sub) = query_manager.get_current_sub_iterator(iterator) else {
                return Ok(None);
            };
            if let Some(volume) = sub.volume() {
                if let Some(entry) = volume.read_query(&sub).await? {
                    return Ok(Some(entry));
                }
            }
            query_manager.next_sub_iterator(iterator);
        }
    }
}

/// Implements `Volume` for a type wrapping a `VirtualVolume` in `$field`,
/// forwarding the directory behaviour. The braces carry the remaining trait
/// items.
macro_rules! virtual_volume_impl {
    ($ty:ty, $field:ident { $($extra:tt)* }) => {
        #[async_trait::async_trait]
        impl $crate::volume::Volume for $ty {
            fn base(&self) -> &$crate::volume::VolumeBase {
                self.$field.base()
            }

            fn root_id(&self) -> netfs_types::LocalNodeId {
                self.$field.root_id()
            }

            fn prepare_to_unmount(&self) {
                self.$field.prepare_to_unmount()
            }

            fn remove_child_volume(&self, child: &dyn $crate::volume::Volume) {
                self.$field.remove_child_volume(child)
            }

            async fn read_vnode(&self, id: netfs_types::LocalNodeId) -> netfs_types::Result<()> {
                self.$field.read_vnode(id)
            }

            fn write_vnode(&self, id: netfs_types::LocalNodeId) {
                self.$field.write_vnode(id)
            }

            fn remove_vnode(&self, id: netfs_types::LocalNodeId) {
                self.$field.remove_vnode(id)
            }

            async fn read_stat(&self, node: netfs_types::LocalNodeId) -> netfs_types::Result<$crate::volume::Stat> {
                self.$field.read_stat(node)
            }

            async fn open_dir(&self, node: netfs_types::LocalNodeId) -> netfs_types::Result<$crate::volume::DirCookie> {
                self.$field.open_dir(node)
            }

            async fn read_dir(
                &self,
                node: netfs_types::LocalNodeId,
                cookie: &mut $crate::volume::DirCookie,
                count: usize,
            ) -> netfs_types::Result<Vec<$crate::volume::DirEntry>> {
                self.$field.read_dir(node, cookie, count)
            }

            async fn rewind_dir(
                &self,
                node: netfs_types::LocalNodeId,
                cookie: &mut $crate::volume::DirCookie,
            ) -> netfs_types::Result<()> {
                self.$field.rewind_dir(node, cookie)
            }

            async fn walk(
                &self,
                dir: netfs_types::LocalNodeId,
                name: &str,
                _resolve_link: bool,
            ) -> netfs_types::Result<$crate::volume::WalkResult> {
                self.$field.walk(dir, name).await
            }

            $($extra)*
        }
    };
}

pub(crate) use virtual_volume_impl;
