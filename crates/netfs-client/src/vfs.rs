//! The host VFS as seen from the volumes, and an in-process implementation.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use netfs_proto::MonitorOpcode;
use netfs_types::{FsCode, LocalNodeId, MountId, Result, Status};
use parking_lot::Mutex;

use crate::volume::VolumeRef;
use crate::volume_manager::VolumeManager;

/// A node-monitoring event in local ids, as the host listeners receive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMonitorEvent {
    pub opcode: MonitorOpcode,
    pub device: MountId,
    /// Directory of the entry; source directory of a move.
    pub directory: LocalNodeId,
    /// Target directory of a move.
    pub to_directory: LocalNodeId,
    pub node: LocalNodeId,
    pub name: Option<String>,
}

/// Vnode primitives of the host VFS.
///
/// A vnode exists while the host holds references to it. The first
/// `get_vnode` of an id makes the host call the owning volume's
/// `read_vnode`; the last `put_vnode` makes it call `write_vnode`, or
/// `remove_vnode` once the vnode was marked removed.
///
/// `get_vnode` and `put_vnode` may call back into a volume before
/// returning. The other primitives never do, so they can be used while a
/// volume-internal lock is held.
#[async_trait]
pub trait HostVfs: Send + Sync + 'static {
    async fn get_vnode(&self, id: LocalNodeId) -> Result<()>;
    fn put_vnode(&self, id: LocalNodeId) -> Result<()>;
    fn remove_vnode(&self, id: LocalNodeId) -> Result<()>;
    fn unremove_vnode(&self, id: LocalNodeId) -> Result<()>;
    fn is_vnode_removed(&self, id: LocalNodeId) -> Result<bool>;

    fn notify_listener(&self, event: NodeMonitorEvent);

    /// Live-query update for the listener registered as `port`/`token`.
    fn send_notification(&self, port: i32, token: i32, event: NodeMonitorEvent);

    /// Called once by the volume manager that uses this VFS.
    fn attach(&self, _manager: Weak<VolumeManager>) {}
}

/// Notifications kept for inspection; older ones are dropped.
const MAX_RECORDED: usize = 1024;

struct Vnode {
    refs: u32,
    removed: bool,
    volume: VolumeRef,
}

/// One delivered notification, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedNotification {
    /// `port`/`token` for query updates, `None` for listener events.
    pub target: Option<(i32, i32)>,
    pub event: NodeMonitorEvent,
}

/// A reference-counting vnode table standing in for a kernel VFS.
///
/// Every live vnode holds a reference to its volume, so a volume with
/// vnodes in use is not torn down.
#[derive(Default)]
pub struct VnodeTable {
    manager: Mutex<Weak<VolumeManager>>,
    vnodes: Mutex<HashMap<LocalNodeId, Vnode>>,
    notifications: Mutex<Vec<RecordedNotification>>,
}

impl VnodeTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ref_count(&self, id: LocalNodeId) -> u32 {
        self.vnodes.lock().get(&id).map_or(0, |v| v.refs)
    }

    pub fn is_loaded(&self, id: LocalNodeId) -> bool {
        self.vnodes.lock().contains_key(&id)
    }

    pub fn notifications(&self) -> Vec<RecordedNotification> {
        self.notifications.lock().clone()
    }

    pub fn take_notifications(&self) -> Vec<RecordedNotification> {
        std::mem::take(&mut *self.notifications.lock())
    }

    fn record(&self, notification: RecordedNotification) {
        let mut notifications = self.notifications.lock();
        if notifications.len() >= MAX_RECORDED {
            notifications.remove(0);
        }
        notifications.push(notification);
    }

    fn not_found(id: LocalNodeId) -> Status {
        Status::with_message(FsCode::ENTRY_NOT_FOUND, format!("no vnode {}", id))
    }
}

#[async_trait]
impl HostVfs for VnodeTable {
    async fn get_vnode(&self, id: LocalNodeId) -> Result<()> {
        if let Some(vnode) = self.vnodes.lock().get_mut(&id) {
            vnode.refs += 1;
            return Ok(());
        }

        let manager = self
            .manager
            .lock()
            .upgrade()
            .ok_or_else(|| Self::not_found(id))?;
        let volume = manager
            .get_volume_for_node(id)
            .ok_or_else(|| Self::not_found(id))?;
        volume.read_vnode(id).await?;

        let mut vnodes = self.vnodes.lock();
        match vnodes.get_mut(&id) {
            // Someone else loaded it meanwhile; our `volume` ref is dropped.
            Some(vnode) => vnode.refs += 1,
            None => {
                vnodes.insert(
                    id,
                    Vnode {
                        refs: 1,
                        removed: false,
                        volume,
                    },
                );
            }
        }
        Ok(())
    }

    fn put_vnode(&self, id: LocalNodeId) -> Result<()> {
        let released = {
            let mut vnodes = self.vnodes.lock();
            let vnode = vnodes.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
            vnode.refs -= 1;
            if vnode.refs > 0 {
                return Ok(());
            }
            vnodes.remove(&id)
        };
        if let Some(vnode) = released {
            if vnode.removed {
                vnode.volume.remove_vnode(id);
            } else {
                vnode.volume.write_vnode(id);
            }
        }
        Ok(())
    }

    fn remove_vnode(&self, id: LocalNodeId) -> Result<()> {
        let mut vnodes = self.vnodes.lock();
        let vnode = vnodes.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        vnode.removed = true;
        Ok(())
    }

    fn unremove_vnode(&self, id: LocalNodeId) -> Result<()> {
        let mut vnodes = self.vnodes.lock();
        let vnode = vnodes.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        vnode.removed = false;
        Ok(())
    }

    fn is_vnode_removed(&self, id: LocalNodeId) -> Result<bool> {
        self.vnodes
            .lock()
            .get(&id)
            .map(|v| v.removed)
            .ok_or_else(|| Self::not_found(id))
    }

    fn notify_listener(&self, event: NodeMonitorEvent) {
        tracing::debug!(?event.opcode, dir = %event.directory, node = %event.node, name = ?event.name, "node monitor event");
        self.record(RecordedNotification {
            target: None,
            event,
        });
    }

    fn send_notification(&self, port: i32, token: i32, event: NodeMonitorEvent) {
        tracing::debug!(port, token, ?event.opcode, node = %event.node, "query update");
        self.record(RecordedNotification {
            target: Some((port, token)),
            event,
        });
    }

    fn attach(&self, manager: Weak<VolumeManager>) {
        *self.manager.lock() = manager;
    }
}
