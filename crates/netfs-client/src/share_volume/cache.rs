//! Nodes, entries and attribute directories of one share, keyed by local id.
//!
//! Everything here is synchronous and runs under the share volume's cache
//! lock. The local/remote id maps are only ever changed together, so each is
//! the exact inverse of the other.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use netfs_proto::{AttrDirInfo, AttributeInfo, EntryInfo, MonitorOpcode, NodeInfo, NodeStat, S_IFDIR};
use netfs_types::{FsCode, LocalNodeId, RPCCode, RemoteNodeId, Result, Revision, Status, StatusCode, VolumeId};

use crate::volume_manager::VolumeManager;

/// (directory, name)
pub(crate) type EntryKey = (LocalNodeId, String);

#[derive(Debug, Clone)]
pub(crate) struct AttrDir {
    pub attributes: Vec<AttributeInfo>,
    pub revision: Revision,
    pub up_to_date: bool,
}

impl AttrDir {
    fn from_info(info: &AttrDirInfo) -> Self {
        Self {
            attributes: info.attributes.clone(),
            revision: info.revision,
            up_to_date: true,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DirState {
    pub entries: BTreeSet<String>,
    pub complete: bool,
    /// Highest revision of an entry-created event that could not be applied.
    pub entry_created_revision: Revision,
    /// Highest revision of an entry-removed event seen. Never decreases.
    pub entry_removed_revision: Revision,
}

impl Default for DirState {
    fn default() -> Self {
        Self {
            entries: BTreeSet::new(),
            complete: false,
            entry_created_revision: Revision::NONE,
            entry_removed_revision: Revision::NONE,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ShareNode {
    pub id: LocalNodeId,
    pub info: NodeInfo,
    pub known_to_vfs: bool,
    pub referring: BTreeSet<EntryKey>,
    pub attr_dir: Option<AttrDir>,
    /// Set for directories.
    pub dir: Option<DirState>,
}

impl ShareNode {
    fn new(id: LocalNodeId, info: NodeInfo) -> Self {
        Self {
            id,
            dir: info.stat.is_dir().then(DirState::default),
            info,
            known_to_vfs: false,
            referring: BTreeSet::new(),
            attr_dir: None,
        }
    }

    pub fn remote_id(&self) -> RemoteNodeId {
        self.info.node_id
    }

    pub fn is_dir(&self) -> bool {
        self.dir.is_some()
    }

    fn update(&mut self, info: &NodeInfo) {
        if info.revision >= self.info.revision {
            self.info = *info;
        }
    }

    /// Referred to by an entry other than `.` or `..`.
    fn has_actual_referring_entry(&self) -> bool {
        self.referring.iter().any(|(_, name)| name != "." && name != "..")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShareEntry {
    pub node: LocalNodeId,
    pub revision: Revision,
}

pub(crate) fn is_dot_name(name: &str) -> bool {
    name == "." || name == ".."
}

pub(crate) struct ShareCache {
    manager: Arc<VolumeManager>,
    volume_id: VolumeId,
    root_id: LocalNodeId,
    local_ids: HashMap<RemoteNodeId, LocalNodeId>,
    remote_ids: HashMap<LocalNodeId, RemoteNodeId>,
    nodes: HashMap<LocalNodeId, ShareNode>,
    entries: BTreeMap<EntryKey, ShareEntry>,
    unmounting: bool,
}

impl ShareCache {
    /// The root node exists from the start; its remote id is mapped once
    /// the share is mounted.
    pub fn new(manager: Arc<VolumeManager>, volume_id: VolumeId, root_id: LocalNodeId) -> Self {
        let root_info = NodeInfo {
            stat: NodeStat {
                mode: S_IFDIR | 0o755,
                nlink: 1,
                ..Default::default()
            },
            revision: Revision::NONE,
            ..Default::default()
        };
        let mut nodes = HashMap::new();
        nodes.insert(root_id, ShareNode::new(root_id, root_info));
        Self {
            manager,
            volume_id,
            root_id,
            local_ids: HashMap::new(),
            remote_ids: HashMap::new(),
            nodes,
            entries: BTreeMap::new(),
            unmounting: false,
        }
    }

    pub fn root_id(&self) -> LocalNodeId {
        self.root_id
    }

    pub fn is_unmounting(&self) -> bool {
        self.unmounting
    }

    // ── id maps ────────────────────────────────────────────────────────

    /// The local id of `remote`, allocating one when `enter` is set.
    pub fn local_id(&mut self, remote: RemoteNodeId, enter: bool) -> Result<LocalNodeId> {
        if let Some(&local) = self.local_ids.get(&remote) {
            return Ok(local);
        }
        if !enter {
            return Err(Status::new(FsCode::ENTRY_NOT_FOUND));
        }
        if self.unmounting {
            return Err(Status::new(RPCCode::NOT_CONNECTED));
        }
        let local = self.manager.new_node_id(self.volume_id)?;
        self.local_ids.insert(remote, local);
        self.remote_ids.insert(local, remote);
        tracing::trace!(volume = %self.volume_id, %local, %remote, "node id entered");
        Ok(local)
    }

    pub fn known_local_id(&self, remote: RemoteNodeId) -> Option<LocalNodeId> {
        self.local_ids.get(&remote).copied()
    }

    pub fn remote_id(&self, local: LocalNodeId) -> Option<RemoteNodeId> {
        self.remote_ids.get(&local).copied()
    }

    /// Forget the mapping of `local` and give the id back. The root keeps
    /// its id, which the volume owns for its whole life.
    pub fn remove_local_id(&mut self, local: LocalNodeId) {
        let Some(remote) = self.remote_ids.remove(&local) else {
            return;
        };
        self.local_ids.remove(&remote);
        if local != self.root_id {
            self.manager.remove_node_id(local);
        }
    }

    /// Bind the root node to the remote root reported by the mount reply.
    pub fn map_root(&mut self, info: &NodeInfo) -> Result<()> {
        if let Some(&existing) = self.local_ids.get(&info.node_id) {
            if existing != self.root_id {
                return Err(Status::with_message(FsCode::EXISTS, "remote root already mapped"));
            }
        }
        if let Some(root) = self.nodes.get_mut(&self.root_id) {
            root.info = *info;
            if root.dir.is_none() {
                root.dir = Some(DirState::default());
            }
        }
        self.local_ids.insert(info.node_id, self.root_id);
        self.remote_ids.insert(self.root_id, info.node_id);
        Ok(())
    }

    // ── nodes ──────────────────────────────────────────────────────────

    pub fn node(&self, local: LocalNodeId) -> Option<&ShareNode> {
        self.nodes.get(&local)
    }

    pub fn node_by_remote(&self, remote: RemoteNodeId) -> Option<&ShareNode> {
        self.nodes.get(self.local_ids.get(&remote)?)
    }

    fn dir_by_remote(&self, remote: RemoteNodeId) -> Option<LocalNodeId> {
        self.node_by_remote(remote).filter(|n| n.is_dir()).map(|n| n.id)
    }

    /// Update the node `info` describes, creating it when unknown.
    pub fn load_node(&mut self, info: &NodeInfo) -> Result<LocalNodeId> {
        if let Some(&local) = self.local_ids.get(&info.node_id) {
            if let Some(node) = self.nodes.get_mut(&local) {
                node.update(info);
                return Ok(local);
            }
        }
        if self.unmounting {
            return Err(Status::new(RPCCode::NOT_CONNECTED));
        }
        let local = self.local_id(info.node_id, true)?;
        self.nodes.insert(local, ShareNode::new(local, *info));
        Ok(local)
    }

    pub fn update_node(&mut self, info: &NodeInfo) -> Result<()> {
        if self.unmounting {
            return Err(Status::new(RPCCode::NOT_CONNECTED));
        }
        let local = self
            .known_local_id(info.node_id)
            .ok_or_else(|| Status::new(FsCode::ENTRY_NOT_FOUND))?;
        let node = self
            .nodes
            .get_mut(&local)
            .ok_or_else(|| Status::new(FsCode::ENTRY_NOT_FOUND))?;
        node.update(info);
        Ok(())
    }

    pub fn set_known_to_vfs(&mut self, local: LocalNodeId, known: bool) -> bool {
        match self.nodes.get_mut(&local) {
            Some(node) => {
                node.known_to_vfs = known;
                true
            }
            None => false,
        }
    }

    /// The host VFS dropped a removed vnode: forget the node for good.
    pub fn drop_node(&mut self, local: LocalNodeId) {
        if local == self.root_id {
            if let Some(root) = self.nodes.get_mut(&local) {
                root.known_to_vfs = false;
            }
            return;
        }
        self.nodes.remove(&local);
        self.remove_local_id(local);
    }

    /// The server says the node is gone. Its entries are dropped and the id
    /// mapping removed at once, so a reused remote id cannot alias it. A
    /// node the host still holds is marked removed there and freed on its
    /// last put.
    pub fn node_removed(&mut self, remote: RemoteNodeId) {
        let Some(local) = self.known_local_id(remote) else {
            return;
        };
        let Some(node) = self.nodes.get(&local) else {
            return;
        };
        if node.has_actual_referring_entry() || local == self.root_id {
            return;
        }

        let own_entries: Vec<EntryKey> = node
            .dir
            .as_ref()
            .map(|dir| dir.entries.iter().map(|name| (local, name.clone())).collect())
            .unwrap_or_default();
        for key in own_entries {
            self.remove_entry(&key);
        }
        let referring: Vec<EntryKey> = self
            .nodes
            .get(&local)
            .map(|n| n.referring.iter().cloned().collect())
            .unwrap_or_default();
        for key in referring {
            self.remove_entry(&key);
        }

        self.remove_local_id(local);
        let known = self.nodes.get(&local).is_some_and(|n| n.known_to_vfs);
        if known {
            if let Err(err) = self.manager.vfs().remove_vnode(local) {
                tracing::debug!(%local, %err, "vnode vanished before removal");
                self.nodes.remove(&local);
            }
        } else {
            self.nodes.remove(&local);
        }
    }

    // ── entries ────────────────────────────────────────────────────────

    pub fn entry(&self, dir: LocalNodeId, name: &str) -> Option<ShareEntry> {
        self.entries.get(&(dir, name.to_owned())).copied()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn dir_state(&self, dir: LocalNodeId) -> Option<&DirState> {
        self.nodes.get(&dir)?.dir.as_ref()
    }

    pub fn is_complete(&self, dir: LocalNodeId) -> bool {
        self.dir_state(dir).is_some_and(|d| d.complete)
    }

    pub fn set_complete(&mut self, dir: LocalNodeId, complete: bool) {
        if let Some(state) = self.nodes.get_mut(&dir).and_then(|n| n.dir.as_mut()) {
            state.complete = complete;
        }
    }

    /// Names currently cached in `dir`, in order.
    pub fn dir_names(&self, dir: LocalNodeId) -> Vec<String> {
        self.dir_state(dir)
            .map(|d| d.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// An info is obsolete when its directory has since seen a removal at
    /// or past its revision.
    pub fn is_obsolete(&self, info: &EntryInfo) -> bool {
        match self.dir_by_remote(info.directory_id).and_then(|d| self.dir_state(d)) {
            Some(state) => info.node_info.revision <= state.entry_removed_revision,
            None => false,
        }
    }

    /// Add or refresh the entry `info` describes in `dir` and return its
    /// node. An entry that now names a different node is replaced.
    pub fn load_entry(&mut self, dir: LocalNodeId, info: &EntryInfo) -> Result<LocalNodeId> {
        if info.name.is_empty() {
            return Err(Status::new(RPCCode::BAD_DATA));
        }
        let dir_node = self
            .nodes
            .get(&dir)
            .filter(|n| n.is_dir())
            .ok_or_else(|| Status::new(FsCode::BAD_VALUE))?;
        let dir_remote = dir_node.remote_id();
        let revision = info.node_info.revision;

        if let Some(existing) = self.entry(dir, &info.name) {
            if revision <= existing.revision {
                return Ok(existing.node);
            }
            let current_remote = self.nodes.get(&existing.node).map(ShareNode::remote_id);
            if current_remote == Some(info.node_info.node_id) {
                if let Some(entry) = self.entries.get_mut(&(dir, info.name.clone())) {
                    entry.revision = revision;
                }
                self.update_node(&info.node_info)?;
                return Ok(existing.node);
            }

            self.entry_removed(dir_remote, &info.name, revision);
            self.entry_created(dir_remote, &info.name, Some(info), revision);
            let replaced = self
                .entry(dir, &info.name)
                .ok_or_else(|| Status::with_message(StatusCode::UNKNOWN, "entry replacement failed"))?;
            if self.nodes.get(&replaced.node).map(ShareNode::remote_id) != Some(info.node_info.node_id) {
                return Err(Status::with_message(StatusCode::UNKNOWN, "entry replacement raced"));
            }
            return Ok(replaced.node);
        }

        if self.unmounting {
            return Err(Status::new(RPCCode::NOT_CONNECTED));
        }
        let node = self.load_node(&info.node_info)?;
        let vfs = self.manager.vfs();
        if matches!(vfs.is_vnode_removed(dir), Ok(true)) || matches!(vfs.is_vnode_removed(node), Ok(true)) {
            return Err(Status::new(FsCode::NOT_ALLOWED));
        }
        let key = (dir, info.name.clone());
        self.entries.insert(key.clone(), ShareEntry { node, revision });
        if let Some(state) = self.nodes.get_mut(&dir).and_then(|n| n.dir.as_mut()) {
            state.entries.insert(info.name.clone());
        }
        if let Some(target) = self.nodes.get_mut(&node) {
            target.referring.insert(key);
        }
        Ok(node)
    }

    fn remove_entry(&mut self, key: &EntryKey) -> Option<ShareEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(state) = self.nodes.get_mut(&key.0).and_then(|n| n.dir.as_mut()) {
            state.entries.remove(&key.1);
        }
        if let Some(node) = self.nodes.get_mut(&entry.node) {
            node.referring.remove(key);
        }
        Some(entry)
    }

    // ── events ─────────────────────────────────────────────────────────

    /// Apply an entry-created event. When the entry cannot be loaded the
    /// directory can no longer be trusted to be complete.
    pub fn entry_created(&mut self, dir_remote: RemoteNodeId, name: &str, info: Option<&EntryInfo>, revision: Revision) {
        if name.is_empty() {
            return;
        }
        let Some(dir) = self.dir_by_remote(dir_remote) else {
            return;
        };
        let loaded = match info {
            Some(info) => self.load_entry(dir, info).is_ok(),
            None => false,
        };
        if !loaded {
            if let Some(state) = self.nodes.get_mut(&dir).and_then(|n| n.dir.as_mut()) {
                state.entry_created_revision = state.entry_created_revision.max(revision);
                state.complete = false;
            }
        }
    }

    pub fn entry_removed(&mut self, dir_remote: RemoteNodeId, name: &str, revision: Revision) {
        if name.is_empty() {
            return;
        }
        let Some(dir) = self.dir_by_remote(dir_remote) else {
            return;
        };
        if let Some(state) = self.nodes.get_mut(&dir).and_then(|n| n.dir.as_mut()) {
            state.entry_removed_revision = state.entry_removed_revision.max(revision);
        }
        let key = (dir, name.to_owned());
        match self.entries.get(&key) {
            Some(entry) if entry.revision <= revision => {
                self.remove_entry(&key);
            }
            _ => {}
        }
    }

    pub fn entry_moved(
        &mut self,
        from_dir: RemoteNodeId,
        from_name: &str,
        to_dir: RemoteNodeId,
        to_name: &str,
        info: Option<&EntryInfo>,
        revision: Revision,
    ) {
        self.entry_removed(from_dir, from_name, revision);
        self.entry_created(to_dir, to_name, info, revision);
    }

    // ── attribute directories ──────────────────────────────────────────

    /// Install `info` as the node's attribute directory unless the cached
    /// one is newer.
    pub fn load_attr_dir(&mut self, local: LocalNodeId, info: &AttrDirInfo) -> Result<()> {
        if !info.is_valid {
            return Err(Status::new(FsCode::BAD_VALUE));
        }
        if self.unmounting {
            return Err(Status::new(RPCCode::NOT_CONNECTED));
        }
        let node = self
            .nodes
            .get_mut(&local)
            .ok_or_else(|| Status::new(FsCode::ENTRY_NOT_FOUND))?;
        match &node.attr_dir {
            Some(current) if current.revision > info.revision => {}
            _ => node.attr_dir = Some(AttrDir::from_info(info)),
        }
        Ok(())
    }

    /// Apply an attribute-changed event. A change that cannot be applied
    /// leaves the cached directory marked stale.
    pub fn update_attr_dir(&mut self, remote: RemoteNodeId, info: &AttrDirInfo) {
        let Some(local) = self.known_local_id(remote) else {
            return;
        };
        if !self.nodes.contains_key(&local) {
            return;
        }
        if !info.is_valid || self.load_attr_dir(local, info).is_err() {
            if let Some(attr_dir) = self.nodes.get_mut(&local).and_then(|n| n.attr_dir.as_mut()) {
                attr_dir.up_to_date = false;
            }
        }
    }

    /// Revision of the node's attribute directory while it is up to date.
    pub fn attr_dir_revision(&self, local: LocalNodeId) -> Option<Revision> {
        self.nodes
            .get(&local)?
            .attr_dir
            .as_ref()
            .filter(|a| a.up_to_date)
            .map(|a| a.revision)
    }

    /// A local write went through: the cached directory is stale unless it
    /// was replaced meanwhile.
    pub fn invalidate_attr_dir(&mut self, local: LocalNodeId, revision: Revision) {
        if let Some(attr_dir) = self.nodes.get_mut(&local).and_then(|n| n.attr_dir.as_mut()) {
            if attr_dir.revision == revision {
                attr_dir.up_to_date = false;
            }
        }
    }

    pub fn up_to_date_attr_dir(&self, local: LocalNodeId) -> Option<&AttrDir> {
        self.nodes.get(&local)?.attr_dir.as_ref().filter(|a| a.up_to_date)
    }

    // ── unmount ────────────────────────────────────────────────────────

    /// Drop every entry with an `EntryRemoved` notification, forget nodes
    /// the host does not hold and return the ones it does.
    pub fn prepare_to_unmount(&mut self) -> Vec<LocalNodeId> {
        self.unmounting = true;
        let device = self.manager.mount_id();
        let entries = std::mem::take(&mut self.entries);
        for ((dir, name), entry) in entries {
            self.manager.vfs().notify_listener(crate::vfs::NodeMonitorEvent {
                opcode: MonitorOpcode::EntryRemoved,
                device,
                directory: dir,
                to_directory: dir,
                node: entry.node,
                name: Some(name),
            });
        }
        for node in self.nodes.values_mut() {
            node.referring.clear();
            if let Some(state) = node.dir.as_mut() {
                state.entries.clear();
                state.complete = false;
            }
        }

        let ids: Vec<LocalNodeId> = self.nodes.keys().copied().collect();
        let mut held = Vec::new();
        for id in ids {
            let known = self.nodes.get(&id).is_some_and(|n| n.known_to_vfs);
            if known {
                held.push(id);
            } else {
                self.remove_local_id(id);
                if id != self.root_id {
                    self.nodes.remove(&id);
                }
            }
        }
        held
    }

    /// Release every remaining id, the root's included.
    pub fn uninit(&mut self) {
        let ids: Vec<LocalNodeId> = self.remote_ids.keys().copied().collect();
        for id in ids {
            self.remove_local_id(id);
        }
        self.nodes.clear();
        self.entries.clear();
        self.manager.remove_node_id(self.root_id);
    }

    #[cfg(test)]
    pub fn ids_consistent(&self) -> bool {
        self.local_ids.len() == self.remote_ids.len()
            && self
                .local_ids
                .iter()
                .all(|(remote, local)| self.remote_ids.get(local) == Some(remote))
    }
}
